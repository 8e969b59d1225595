//! Affect that survives a restart.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::engine::AffectBook;
use crate::error::StoreError;
use crate::types::{AffectState, PadVector};

/// Durable copy of the emotion engine's states. The engine restores from it
/// once at startup and writes back on every decay tick and at shutdown.
#[async_trait::async_trait]
pub trait AffectStore: Send + Sync {
    async fn load(&self) -> Result<AffectBook, StoreError>;

    async fn save(&self, context_id: &str, state: &AffectState) -> Result<(), StoreError>;

    async fn remove(&self, context_id: &str) -> Result<(), StoreError>;
}

/// Process-local affect store for ephemeral mode and tests.
#[derive(Debug)]
pub struct InMemoryAffectStore {
    book: Mutex<AffectBook>,
    available: AtomicBool,
}

impl Default for InMemoryAffectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAffectStore {
    pub fn new() -> Self {
        Self { book: Mutex::new(AffectBook::new()), available: AtomicBool::new(true) }
    }

    /// Pre-filled store, as if a previous process had saved `book`.
    pub fn with_states(book: AffectBook) -> Self {
        Self { book: Mutex::new(book), available: AtomicBool::new(true) }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn get(&self, context_id: &str) -> Option<AffectState> {
        self.lock().get(context_id).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AffectBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory affect store switched off".into()))
        }
    }
}

#[async_trait::async_trait]
impl AffectStore for InMemoryAffectStore {
    async fn load(&self) -> Result<AffectBook, StoreError> {
        self.check()?;
        Ok(self.lock().clone())
    }

    async fn save(&self, context_id: &str, state: &AffectState) -> Result<(), StoreError> {
        self.check()?;
        self.lock().insert(context_id.to_string(), *state);
        Ok(())
    }

    async fn remove(&self, context_id: &str) -> Result<(), StoreError> {
        self.check()?;
        self.lock().remove(context_id);
        Ok(())
    }
}

/// Postgres-backed affect in the `affect_states` table, one row per context.
#[derive(Debug, Clone)]
pub struct PgAffectStore {
    pool: PgPool,
}

impl PgAffectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AffectStore for PgAffectStore {
    async fn load(&self) -> Result<AffectBook, StoreError> {
        let rows = sqlx::query_as::<_, AffectRow>(
            "SELECT context_id, pleasure, arousal, dominance, grudge_since, updated_at FROM affect_states",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AffectRow::into_entry).collect())
    }

    async fn save(&self, context_id: &str, state: &AffectState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO affect_states (context_id, pleasure, arousal, dominance, grudge_since, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (context_id) DO UPDATE SET \
             pleasure = EXCLUDED.pleasure, arousal = EXCLUDED.arousal, dominance = EXCLUDED.dominance, \
             grudge_since = EXCLUDED.grudge_since, updated_at = EXCLUDED.updated_at",
        )
        .bind(context_id)
        .bind(state.pleasure)
        .bind(state.arousal)
        .bind(state.dominance)
        .bind(state.grudge_since)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, context_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM affect_states WHERE context_id = $1")
            .bind(context_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct AffectRow {
    context_id: String,
    pleasure: f32,
    arousal: f32,
    dominance: f32,
    grudge_since: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl AffectRow {
    /// Rows edited by hand may hold out-of-range values; clamp them.
    fn into_entry(self) -> (String, AffectState) {
        let mut state = AffectState::at(PadVector::new(self.pleasure, self.arousal, self.dominance), self.updated_at);
        state.grudge_since = self.grudge_since;
        (self.context_id, state)
    }
}
