//! Error taxonomy for the delivery pipeline.
//!
//! Retryability is part of the contract: `CasConflict`, `StoreUnavailable`
//! and `LogUnavailable` are retried by their callers; `SerializationPoison`
//! is quarantined immediately; `Processing` carries enough context to build
//! a dead-letter record after the retry budget is spent.

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Compare-and-set on a shared grid entry lost the race past the retry
    /// bound.  Retryable by the caller.
    #[error("cas conflict: {0}")]
    CasConflict(String),

    #[error("durable store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("log unavailable: {0}")]
    LogUnavailable(String),

    /// Degraded mode: callers fall back to local caches and retry.
    #[error("grid unavailable: {0}")]
    GridUnavailable(String),

    /// A payload that cannot be deserialized.  Never retried; the offending
    /// row or record is quarantined out of the hot path.
    #[error("poison payload: {0}")]
    SerializationPoison(String),

    /// An event the consumer could not process within its retry budget.
    #[error("processing failure: {title}")]
    Processing { title: String, detail: String },

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Errors the background loops may retry on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::CasConflict(_)
                | CoreError::StoreUnavailable(_)
                | CoreError::LogUnavailable(_)
                | CoreError::GridUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::SerializationPoison(e.to_string())
    }
}
