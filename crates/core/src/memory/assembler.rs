use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::embedding::Embedder;
use super::episodic::EpisodicBuffer;
use super::store::MemoryStore;
use crate::types::{ContextId, MemoryRecord};

/// Prompt context for one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    /// Episodic records, oldest first.
    pub recent: Vec<MemoryRecord>,
    /// Long-term records, most similar first.
    pub recalled: Vec<MemoryRecord>,
    /// Long-term retrieval failed; only episodic records are present.
    pub degraded: bool,
    /// Something was dropped to stay within the budget.
    pub truncated: bool,
}

impl AssembledContext {
    pub fn len(&self) -> usize {
        self.recent.len() + self.recalled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_chars(&self) -> usize {
        self.recent.iter().chain(&self.recalled).map(MemoryRecord::rendered_len).sum()
    }
}

/// Memory of one conversation: its episodic buffer plus shared long-term
/// storage. Owned by that conversation's turn worker.
pub struct MemoryAssembler {
    context_id: ContextId,
    buffer: EpisodicBuffer,
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn Embedder>,
    budget_chars: usize,
}

impl MemoryAssembler {
    pub fn new(
        context_id: impl Into<ContextId>,
        buffer_size: usize,
        budget_chars: usize,
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            buffer: EpisodicBuffer::new(buffer_size),
            store,
            embedder,
            budget_chars,
        }
    }

    pub fn buffer(&self) -> &EpisodicBuffer {
        &self.buffer
    }

    /// Refill the episodic buffer from the newest stored records of this
    /// context, so a restarted worker keeps the thread of the conversation.
    /// A store failure leaves the buffer empty. Returns how many were loaded.
    pub async fn hydrate(&mut self) -> usize {
        match self.store.recent(&self.context_id, self.buffer.capacity()).await {
            Ok(records) => {
                let loaded = records.len();
                for record in records.into_iter().rev() {
                    if !self.buffer.contains(record.id) {
                        self.buffer.push(record);
                    }
                }
                loaded
            }
            Err(e) => {
                tracing::warn!(context = %self.context_id, error = %e, "could not reload recent memory");
                0
            }
        }
    }

    /// Push into the episodic buffer now; embed and persist in the background.
    /// Persistence failures are logged and never surface to the caller.
    pub fn record(&mut self, record: MemoryRecord) -> JoinHandle<()> {
        self.buffer.push(record.clone());

        let store = Arc::clone(&self.store);
        let embedder = Arc::clone(&self.embedder);
        tokio::spawn(async move {
            let mut record = record;
            match embedder.embed(&record.text).await {
                Ok(v) => record.embedding = Some(v),
                Err(e) => {
                    tracing::warn!(context = %record.context_id, error = %e, "embedding failed, persisting without vector");
                }
            }
            if let Err(e) = store.persist(&record).await {
                tracing::warn!(context = %record.context_id, record = %record.id, error = %e, "memory persist failed");
            }
        })
    }

    /// Record both sides of a completed turn.
    pub fn record_turn(
        &mut self,
        user_speaker: &str,
        user_text: &str,
        reply_speaker: &str,
        reply_text: Option<&str>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.record(MemoryRecord::new(self.context_id.clone(), user_speaker, user_text))];
        if let Some(reply) = reply_text {
            handles.push(self.record(MemoryRecord::new(self.context_id.clone(), reply_speaker, reply)));
        }
        handles
    }

    /// Recent records plus up to `k` recalled records within the char budget.
    /// Long-term failures degrade the result instead of failing the call.
    pub async fn assemble(&self, query: &str, k: usize) -> AssembledContext {
        let (candidates, degraded) = if k == 0 {
            (Vec::new(), false)
        } else {
            match self.recall(query, k).await {
                Ok(found) => (found, false),
                Err(e) => {
                    tracing::warn!(context = %self.context_id, error = %e, "long-term recall failed, using episodic memory only");
                    (Vec::new(), true)
                }
            }
        };

        let mut used = 0usize;
        let mut truncated = false;

        let mut recent = Vec::new();
        for record in self.buffer.iter().rev() {
            let cost = record.rendered_len();
            if used + cost > self.budget_chars {
                truncated = true;
                break;
            }
            used += cost;
            recent.push(record.clone());
        }
        recent.reverse();

        let mut recalled = Vec::new();
        for record in candidates {
            let cost = record.rendered_len();
            if used + cost > self.budget_chars {
                truncated = true;
                break;
            }
            used += cost;
            recalled.push(record);
        }

        AssembledContext { recent, recalled, degraded, truncated }
    }

    async fn recall(&self, query: &str, k: usize) -> Result<Vec<MemoryRecord>, crate::error::StoreError> {
        let embedding = self.embedder.embed(query).await?;
        // Over-fetch so that dropping buffer duplicates still leaves k.
        let hits = self.store.search(&embedding, k + self.buffer.len()).await?;

        let mut seen = HashSet::new();
        Ok(hits
            .into_iter()
            .filter(|r| !self.buffer.contains(r.id) && seen.insert(r.id))
            .take(k)
            .collect())
    }
}
