//! Error types for the connection pool.

use dataport_core::error::MigrationError;
use std::time::Duration;

/// Errors produced by pool construction and acquisition.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// No handle became available within the acquire timeout. Callers
    /// may retry with backoff.
    #[error("pool exhausted: no client available within {waited:?}")]
    Exhausted {
        /// The acquire timeout that elapsed.
        waited: Duration,
    },

    /// A source failed to produce a seed, or cloning the seed failed.
    #[error("source '{source_name}' failed to produce a client: {reason}")]
    ConnectionFailed { source_name: String, reason: String },

    /// The pool was disposed.
    #[error("pool is closed")]
    Closed,

    /// The pool was constructed with invalid options or no sources.
    #[error("invalid pool configuration: {0}")]
    Configuration(String),
}

impl From<PoolError> for MigrationError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Exhausted { waited } => MigrationError::PoolExhausted { waited },
            PoolError::ConnectionFailed {
                source_name,
                reason,
            } => MigrationError::ConnectionFailed {
                source_name,
                reason,
            },
            PoolError::Closed => MigrationError::Fatal("connection pool is closed".into()),
            PoolError::Configuration(message) => MigrationError::Configuration(message),
        }
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
