//! Server error types and their mapping to stable RPC status codes.
//!
//! Clients key their recovery off the status code, never the message:
//! out-of-range means wait or re-check bounds, failed-precondition means
//! re-resolve the leader, permission-denied is final.

use quill_cluster::ClusterError;
use quill_log::LogError;
use thiserror::Error;
use tonic::Status;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors the service surfaces to clients.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Read below the lowest or at/above the next offset.
    #[error("offset out of range: {offset}")]
    OffsetOutOfRange {
        /// The requested offset.
        offset: u64,
    },

    /// Produce was sent to a follower.
    #[error("not the leader")]
    NotLeader {
        /// The current leader's RPC address, when known.
        leader_hint: Option<String>,
    },

    /// No leader was available within the commit timeout.
    #[error("cluster unavailable")]
    Unavailable,

    /// The caller may not perform this action.
    #[error("{subject} is not permitted to {action}")]
    PermissionDenied {
        /// The authenticated subject.
        subject: String,
        /// The refused action.
        action: String,
    },

    /// The node is shutting down.
    #[error("server is closed")]
    Closed,

    /// Anything that should not normally happen.
    #[error("internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl ServerError {
    /// True when this error is the consume-stream wait signal.
    #[must_use]
    pub const fn is_offset_out_of_range(&self) -> bool {
        matches!(self, Self::OffsetOutOfRange { .. })
    }
}

impl From<LogError> for ServerError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::OffsetOutOfRange { offset } => Self::OffsetOutOfRange { offset },
            LogError::Closed => Self::Closed,
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<ClusterError> for ServerError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotLeader { leader_hint } => Self::NotLeader { leader_hint },
            ClusterError::Unavailable => Self::Unavailable,
            ClusterError::Closed => Self::Closed,
            ClusterError::Log(log_err) => log_err.into(),
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<ServerError> for Status {
    fn from(err: ServerError) -> Self {
        match &err {
            ServerError::OffsetOutOfRange { .. } => Self::out_of_range(err.to_string()),
            ServerError::NotLeader { leader_hint } => {
                let message = leader_hint.as_deref().map_or_else(
                    || err.to_string(),
                    |hint| format!("{err}, leader is at {hint}"),
                );
                Self::failed_precondition(message)
            }
            ServerError::Unavailable | ServerError::Closed => Self::unavailable(err.to_string()),
            ServerError::PermissionDenied { .. } => Self::permission_denied(err.to_string()),
            ServerError::Internal { .. } => Self::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        let cases = [
            (
                ServerError::OffsetOutOfRange { offset: 7 },
                tonic::Code::OutOfRange,
            ),
            (
                ServerError::NotLeader { leader_hint: None },
                tonic::Code::FailedPrecondition,
            ),
            (ServerError::Unavailable, tonic::Code::Unavailable),
            (
                ServerError::PermissionDenied {
                    subject: "nobody".into(),
                    action: "produce".into(),
                },
                tonic::Code::PermissionDenied,
            ),
            (ServerError::Closed, tonic::Code::Unavailable),
        ];
        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn test_leader_hint_reaches_the_message() {
        let status = Status::from(ServerError::NotLeader {
            leader_hint: Some("10.0.0.9:8400".into()),
        });
        assert!(status.message().contains("10.0.0.9:8400"));
    }
}
