use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::embedding::cosine_similarity;
use crate::error::StoreError;
use crate::types::MemoryRecord;

/// Long-term memory. Records persist until an explicit purge.
#[async_trait::async_trait]
pub trait MemoryStore: Send + Sync {
    async fn persist(&self, record: &MemoryRecord) -> Result<(), StoreError>;

    /// Up to `k` records ranked by similarity to `embedding`, best first.
    /// Records without an embedding are never returned.
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<MemoryRecord>, StoreError>;

    /// Newest records of one context, newest first.
    async fn recent(&self, context_id: &str, limit: usize) -> Result<Vec<MemoryRecord>, StoreError>;

    /// Administrative delete. Returns how many records were removed.
    async fn purge(&self, ids: &[Uuid]) -> Result<u64, StoreError>;
}

/// Rank `candidates` by cosine similarity to `query` and keep the best `k`.
pub(crate) fn rank(query: &[f32], candidates: Vec<MemoryRecord>, k: usize) -> Vec<MemoryRecord> {
    let mut scored: Vec<(f32, MemoryRecord)> = candidates
        .into_iter()
        .filter_map(|r| {
            let score = cosine_similarity(query, r.embedding.as_deref()?);
            Some((score, r))
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored.into_iter().map(|(_, r)| r).collect()
}

/// Process-local store. Used when no database is configured and in tests,
/// where `set_available(false)` simulates an outage.
#[derive(Debug)]
pub struct InMemoryStore {
    records: Mutex<Vec<MemoryRecord>>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { records: Mutex::new(Vec::new()), available: AtomicBool::new(true) }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<MemoryRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MemoryRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".into()))
        }
    }
}

#[async_trait::async_trait]
impl MemoryStore for InMemoryStore {
    async fn persist(&self, record: &MemoryRecord) -> Result<(), StoreError> {
        self.check()?;
        let mut records = self.lock();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<MemoryRecord>, StoreError> {
        self.check()?;
        let candidates = self.lock().clone();
        Ok(rank(embedding, candidates, k))
    }

    async fn recent(&self, context_id: &str, limit: usize) -> Result<Vec<MemoryRecord>, StoreError> {
        self.check()?;
        let mut found: Vec<MemoryRecord> = self
            .lock()
            .iter()
            .filter(|r| r.context_id == context_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        found.truncate(limit);
        Ok(found)
    }

    async fn purge(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        self.check()?;
        let mut records = self.lock();
        let before = records.len();
        records.retain(|r| !ids.contains(&r.id));
        Ok((before - records.len()) as u64)
    }
}
