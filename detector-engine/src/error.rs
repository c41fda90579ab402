//! Engine-wide error taxonomy.
//!
//! Every component's richer error enum ultimately converts into one of
//! these kinds so the scheduler can decide retry vs. degrade vs. restart
//! without inspecting which component failed.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Timeouts, 5xx responses, connection resets. Retried with backoff and
    /// tracked by the circuit breaker.
    #[error("transient error: {0}")]
    Transient(String),

    /// Malformed audio, a non-audio stream, or similar bad input from a
    /// station. The station is marked degraded; the worker keeps running.
    #[error("permanent input error: {0}")]
    PermanentInput(String),

    /// Missing API key, invalid database URL, or similar startup
    /// misconfiguration. The engine refuses to start.
    #[error("permanent configuration error: {0}")]
    PermanentConfig(String),

    /// An ISRC-uniqueness violation (or similar) during track creation.
    /// The caller must retry the resolver cascade from its database-read
    /// step rather than treat this as a permanent failure.
    #[error("data conflict: {0}")]
    DataConflict(String),

    /// An unexpected condition a worker cannot recover from. The worker
    /// exits; the scheduler restarts it after a backoff.
    #[error("fatal worker error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Common(#[from] detector_common::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the originating worker should keep running after this error
    /// (as opposed to exiting for the scheduler to restart).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::Fatal(_) | EngineError::PermanentConfig(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                EngineError::DataConflict(err.to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                EngineError::Transient(err.to_string())
            }
            _ => EngineError::Common(detector_common::Error::Database(err)),
        }
    }
}

impl From<crate::ingest::IngestError> for EngineError {
    fn from(err: crate::ingest::IngestError) -> Self {
        use crate::ingest::IngestError;
        match err {
            IngestError::NotAudio(_) => EngineError::PermanentInput(err.to_string()),
            IngestError::Unreachable(_) | IngestError::Timeout | IngestError::StreamClosed => {
                EngineError::Transient(err.to_string())
            }
            IngestError::DecodeError(_) => EngineError::PermanentInput(err.to_string()),
        }
    }
}

impl From<crate::resolver::ResolverError> for EngineError {
    fn from(err: crate::resolver::ResolverError) -> Self {
        match err {
            crate::resolver::ResolverError::Persistence(inner) => EngineError::Common(inner),
        }
    }
}
