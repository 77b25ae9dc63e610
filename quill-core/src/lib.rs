//! Quill Core - Strongly-typed identifiers and shared limits.
//!
//! This crate provides the small set of types shared across the Quill
//! workspace. It deliberately has no dependencies: everything heavier
//! (I/O, consensus, RPC) lives in the crates that need it.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: Prevent mixing up a raft `Term` with a `LogIndex`
//! - **Explicit types**: Use u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod types;

pub use types::{LogIndex, ServerId, Term};

/// Resource limits shared across the workspace.
pub mod limits {
    /// Maximum size of a single record value in bytes (1 MB).
    pub const RECORD_VALUE_BYTES_MAX: u32 = 1024 * 1024;

    /// Maximum number of voting members in a cluster.
    pub const CLUSTER_SIZE_MAX: usize = 7;

    /// Maximum number of entries shipped in one `AppendEntries` request.
    pub const APPEND_ENTRIES_BATCH_MAX: usize = 1000;
}
