use thiserror::Error;

use crate::retrieval::StrategyKind;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{kind} strategy error: {message}")]
    Strategy { kind: StrategyKind, message: String },

    #[error("all {attempted} selected strategies failed or returned nothing")]
    DispatchExhausted { attempted: usize },

    #[error("step '{step}' failed: {message}")]
    Step { step: String, message: String },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("chain error: {0}")]
    Chain(String),
}

/// Delivery failures confined to the streaming bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamingError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already terminated: {0}")]
    SessionTerminated(String),

    #[error("session already has an attached emitter: {0}")]
    SessionAlreadyAttached(String),

    #[error("subscriber for session {session_id} lagged, {skipped} events dropped")]
    Overflow { session_id: String, skipped: u64 },
}

impl RelayError {
    /// Errors that must not trigger a chain retry.
    pub fn is_validation(&self) -> bool {
        matches!(self, RelayError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
