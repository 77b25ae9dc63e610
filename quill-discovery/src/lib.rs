//! Quill Discovery - gossip-based cluster membership.
//!
//! Nodes discover each other over UDP: each node periodically exchanges
//! its full member view with a few random peers, detects silent peers as
//! failed, and broadcasts a graceful goodbye on leave. Join and leave
//! events drive a [`Handler`] — in production the replicated log, which
//! admits and removes raft voters as servers come and go.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod error;
mod membership;

pub use error::{DiscoveryError, DiscoveryResult};
pub use membership::{DiscoveryConfig, Handler, Member, MemberStatus, Membership, RPC_ADDR_TAG};
