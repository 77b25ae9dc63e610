//! Cluster error types.

use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur in the replicated log.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The operation requires the leader and this node is not it.
    #[error("not the leader{}", .leader_hint.as_deref().map(|h| format!(", try {h}")).unwrap_or_default())]
    NotLeader {
        /// The current leader's address, when known.
        leader_hint: Option<String>,
    },

    /// No leader emerged (or committed the proposal) within the timeout.
    #[error("cluster unavailable")]
    Unavailable,

    /// The replicated log was shut down.
    #[error("replicated log is closed")]
    Closed,

    /// An error from the local log.
    #[error(transparent)]
    Log(#[from] quill_log::LogError),

    /// An error from raft storage.
    #[error(transparent)]
    Storage(#[from] quill_raft::StorageError),

    /// A malformed command or snapshot payload.
    #[error("corrupt payload: {what}")]
    Corrupt {
        /// What failed to decode.
        what: &'static str,
    },

    /// An I/O failure outside the storage layer.
    #[error("I/O error: {operation}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl ClusterError {
    /// Creates an I/O error tagged with the failing operation.
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// True when a retry against the (new) leader could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NotLeader { .. } | Self::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_leader_display() {
        let bare = ClusterError::NotLeader { leader_hint: None };
        assert_eq!(format!("{bare}"), "not the leader");

        let hinted = ClusterError::NotLeader {
            leader_hint: Some("10.0.0.7:9001".to_string()),
        };
        assert_eq!(format!("{hinted}"), "not the leader, try 10.0.0.7:9001");
    }
}
