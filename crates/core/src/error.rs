/// Configuration rejected at startup. Fatal: the runtime refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("config table unreadable: {0}")]
    Db(#[from] sqlx::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { key, reason: reason.into() }
    }
}

/// Long-term memory failures. Callers degrade rather than abort a turn.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("memory store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("embedding failed: {0}")]
    Embedding(String),
}

/// A resource sample could not be taken. The tick is skipped.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("resource read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("unparseable resource data: {0}")]
    Parse(String),
    #[error("resource monitoring unsupported on this platform")]
    Unsupported,
}
