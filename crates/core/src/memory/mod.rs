//! Conversation memory: a per-context episodic buffer in front of a shared
//! long-term store searched by embedding similarity.

pub mod assembler;
pub mod embedding;
pub mod episodic;
pub mod pg;
pub mod store;

pub use assembler::{AssembledContext, MemoryAssembler};
pub use embedding::{Embedder, HashEmbedder, cosine_similarity};
pub use episodic::EpisodicBuffer;
pub use pg::PgMemoryStore;
pub use store::{InMemoryStore, MemoryStore};
