// crates/dossier-server/src/error.rs
// Standardized error types for the engine

use thiserror::Error;

/// Main error type for the Dossier engine.
///
/// Disposition follows a "degrade rather than fail" philosophy: only
/// admission errors (`InvalidQuery`, `RateLimited`) and total backend
/// outage terminate an invocation without a response. `Budget` and
/// `Upstream` reroute analysis to the local model; `Capacity` and
/// `IndexUnavailable` are retried once before surfacing.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("local model queue is full")]
    Capacity,

    #[error("local model failed: {0}")]
    Model(String),

    #[error("daily external model budget exhausted")]
    Budget,

    #[error("external model call failed: {0}")]
    Upstream(String),

    #[error("search index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether a retry (with backoff) can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Capacity | EngineError::IndexUnavailable(_) | EngineError::Upstream(_)
        )
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            EngineError::Cancelled
        } else {
            EngineError::Model(err.to_string())
        }
    }
}

impl From<EngineError> for String {
    fn from(err: EngineError) -> Self {
        err.to_string()
    }
}
