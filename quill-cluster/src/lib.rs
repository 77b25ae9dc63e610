//! Quill Cluster - the replicated log.
//!
//! This crate runs the pure consensus machine from `quill-raft` against
//! real resources: a TCP transport multiplexed with the application RPC
//! on a single port, file-backed raft storage, and a state machine that
//! applies committed commands to the local `quill-log` log.
//!
//! The public surface is [`ReplicatedLog`]: the same append/read contract
//! as the local log, with writes routed through consensus.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod codec;
mod error;
mod fsm;
mod replicated;
mod runtime;
mod storage;
mod stream;
mod transport;

pub use codec::CodecError;
pub use error::{ClusterError, ClusterResult};
pub use fsm::{LogStateMachine, StateMachine};
pub use replicated::{ClusterConfig, ReplicatedLog};
pub use storage::{FileSnapshotStore, FileStableStore, SegmentedLogStore};
pub use stream::{bind_listener, PeekedStream, StreamLayer, RAFT_SENTINEL};
pub use transport::Transport;
