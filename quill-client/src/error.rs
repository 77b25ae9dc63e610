//! Client error types.

use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors from cluster-aware clients.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connecting to a server failed.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A call came back with a non-OK status.
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    /// The resolved view has no leader to produce to.
    #[error("no leader in the resolved server list")]
    NoLeader,

    /// The resolved view is empty.
    #[error("no servers resolved")]
    NoServers,
}

impl ClientError {
    /// True when re-resolving and retrying could help.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoLeader | Self::NoServers | Self::Transport(_) => true,
            Self::Rpc(status) => matches!(
                status.code(),
                tonic::Code::FailedPrecondition | tonic::Code::Unavailable
            ),
        }
    }
}
