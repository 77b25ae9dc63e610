//! Log error types.
//!
//! All errors are explicit and typed. No string errors.

use thiserror::Error;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// Requested offset is below the lowest or at/above the next offset.
    #[error("offset out of range: {offset}")]
    OffsetOutOfRange {
        /// The requested offset.
        offset: u64,
    },

    /// The index has no entry to read, or no room to write one.
    ///
    /// This is an internal rotation signal: the segment that observes it
    /// is maxed. It is never surfaced to users of [`crate::Log`].
    #[error("end of index")]
    Eof,

    /// The log was closed; the operation cannot proceed.
    #[error("log is closed")]
    Closed,

    /// A stored record could not be decoded.
    #[error("corrupt record frame at store position {position}")]
    Corrupt {
        /// Byte position of the frame in the store file.
        position: u64,
        /// The decode failure.
        #[source]
        source: prost::DecodeError,
    },

    /// I/O error from the underlying files.
    #[error("I/O error: {operation}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl LogError {
    /// Creates an I/O error tagged with the failing operation.
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// Returns true if this error is the internal end-of-index signal.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    /// Returns true if this error reports an out-of-range offset.
    #[must_use]
    pub const fn is_offset_out_of_range(&self) -> bool {
        matches!(self, Self::OffsetOutOfRange { .. })
    }
}
