pub mod ollama;
pub mod provider;

pub use ollama::OllamaBackend;
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, InferenceBackend, LlmError, MockBackend, Role,
};
