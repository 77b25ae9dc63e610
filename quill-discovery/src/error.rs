//! Discovery error types.

use thiserror::Error;

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors from the membership layer.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The gossip socket failed.
    #[error("I/O error: {operation}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The membership was already stopped.
    #[error("membership is closed")]
    Closed,
}

impl DiscoveryError {
    /// Creates an I/O error tagged with the failing operation.
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }
}
