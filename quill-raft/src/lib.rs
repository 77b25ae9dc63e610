//! Quill Raft - Raft consensus for the replicated log.
//!
//! This crate provides the *pure* consensus state machine: [`RaftNode`]
//! performs no I/O. Callers feed it ticks and messages and execute the
//! [`RaftOutput`] actions it emits — persist entries and hard state, send
//! messages, apply committed entries. That split keeps the algorithm
//! deterministic and testable without a network or a disk.
//!
//! The runtime half (timers, transport, storage, state-machine apply)
//! lives in `quill-cluster`.
//!
//! # Design Principles
//!
//! - **Correctness first**: election and commit rules follow the Raft
//!   paper, including the current-term commit restriction
//! - **Deterministic core**: the only randomness is the election jitter,
//!   drawn when a timer is armed
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod config;
mod entry;
mod log;
mod message;
mod node;
mod storage;

pub use config::RaftOptions;
pub use entry::{Configuration, Entry, EntryKind, Server};
pub use log::RaftLog;
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, Message, RequestVoteRequest, RequestVoteResponse,
};
pub use node::{RaftNode, RaftOutput, RaftRole};
pub use storage::{
    HardState, LogStore, MemoryStore, SnapshotMeta, SnapshotSource, SnapshotStore, StableStore,
    StorageError, StorageResult,
};
