//! Shared error types for the detection engine and its collaborators.
//!
//! Mirrors the error-kind taxonomy the engine is built around: most local
//! errors are transient or permanent-input conditions a worker can absorb,
//! a handful are fatal to a single worker, and only missing/invalid
//! configuration at startup is fatal to the whole process.

use thiserror::Error;

/// Common result type for detector-common operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories shared across the workspace.
///
/// `detector-engine` layers its own richer error enums (`ResolverError`,
/// `IngestError`, ...) on top of this for component-specific detail, but
/// every one of them ultimately converts into one of these kinds so the
/// scheduler can decide retry vs. degrade vs. restart without knowing which
/// component failed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is characteristic of a transient network/database
    /// condition that's worth retrying rather than surfacing immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}
