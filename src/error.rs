//! Error types for Shardgate.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Shardgate operations.
///
/// The limiter and session stores never fail on unknown keys; errors only
/// come from configuration, bounded waits and snapshot handling.
#[derive(Error, Debug)]
pub enum ShardgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bounded wait for a route permit expired before a permit was granted
    #[error("Timed out after {waited:?} waiting for a permit on route {route}")]
    WaitTimeout {
        /// Display form of the route that was waited on
        route: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// Session snapshot (de)serialization errors
    #[error("Session snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShardgateError {
    /// Whether the failed operation can simply be tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShardgateError::WaitTimeout { .. })
    }
}

/// Result type alias for Shardgate operations.
pub type Result<T> = std::result::Result<T, ShardgateError>;
