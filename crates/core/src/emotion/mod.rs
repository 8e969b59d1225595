//! Pleasure/arousal/dominance affect with a time-of-day baseline.

pub mod circadian;
pub mod engine;
pub mod persist;
pub mod sentiment;

pub use circadian::{Baseline, CircadianCurve, phase_name};
pub use engine::{AffectBook, AffectView, AffectWatch, EmotionEngine, GLOBAL_CONTEXT};
pub use persist::{AffectStore, InMemoryAffectStore, PgAffectStore};
pub use sentiment::{KeywordSentiment, SentimentEstimator, is_apology};
