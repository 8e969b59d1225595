use sqlx::PgPool;
use uuid::Uuid;

use super::store::{MemoryStore, rank};
use crate::error::StoreError;
use crate::types::MemoryRecord;

/// Postgres-backed long-term memory in the `memories` table.
///
/// Search pulls the newest `search_window` embedded rows and ranks them by
/// cosine similarity in process.
#[derive(Debug, Clone)]
pub struct PgMemoryStore {
    pool: PgPool,
    search_window: i64,
}

impl PgMemoryStore {
    pub fn new(pool: PgPool, search_window: i64) -> Self {
        Self { pool, search_window: search_window.max(1) }
    }
}

#[async_trait::async_trait]
impl MemoryStore for PgMemoryStore {
    async fn persist(&self, record: &MemoryRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO memories (id, context_id, speaker, text, embedding, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET embedding = EXCLUDED.embedding",
        )
        .bind(record.id)
        .bind(&record.context_id)
        .bind(&record.speaker)
        .bind(&record.text)
        .bind(&record.embedding)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<MemoryRecord>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, MemoryRow>(
            "SELECT id, context_id, speaker, text, embedding, created_at \
             FROM memories WHERE embedding IS NOT NULL ORDER BY created_at DESC LIMIT $1",
        )
        .bind(self.search_window)
        .fetch_all(&self.pool)
        .await?;

        let candidates = rows.into_iter().map(Into::into).collect();
        Ok(rank(embedding, candidates, k))
    }

    async fn recent(&self, context_id: &str, limit: usize) -> Result<Vec<MemoryRecord>, StoreError> {
        let rows = sqlx::query_as::<_, MemoryRow>(
            "SELECT id, context_id, speaker, text, embedding, created_at \
             FROM memories WHERE context_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(context_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn purge(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM memories WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        tracing::info!(removed = result.rows_affected(), "memories purged");
        Ok(result.rows_affected())
    }
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct MemoryRow {
    id: Uuid,
    context_id: String,
    speaker: String,
    text: String,
    embedding: Option<Vec<f32>>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<MemoryRow> for MemoryRecord {
    fn from(row: MemoryRow) -> Self {
        Self {
            id: row.id,
            context_id: row.context_id,
            speaker: row.speaker,
            text: row.text,
            embedding: row.embedding,
            timestamp: row.created_at,
        }
    }
}
