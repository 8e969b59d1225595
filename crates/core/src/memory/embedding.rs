//! Text embeddings for long-term recall.

use ghost_llm::OllamaBackend;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::StoreError;

/// Dimension of [`HashEmbedder`] vectors.
pub const HASH_EMBED_DIM: usize = 256;

#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError>;
}

/// Deterministic hashed bag-of-words embedding, L2-normalized.
///
/// Texts sharing words land close together, which is enough for recall
/// without a model. Same input always yields the same vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn generate(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; HASH_EMBED_DIM];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % HASH_EMBED_DIM as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        normalize(&mut v);
        v
    }
}

#[async_trait::async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        Ok(Self::generate(text))
    }
}

#[async_trait::async_trait]
impl Embedder for OllamaBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        let mut v = OllamaBackend::embed(self, text)
            .await
            .map_err(|e| StoreError::Embedding(e.to_string()))?;
        normalize(&mut v);
        Ok(v)
    }
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Cosine similarity. Mismatched lengths or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
