//! Quill Server - the gRPC surface and the agent that runs a node.
//!
//! The service speaks `log.v1` over capability traits so the same
//! handlers serve a plain local log in tests and the replicated log in
//! production. The [`Agent`] wires a whole node together: one listener
//! multiplexing consensus and RPC, the replicated log, gossip
//! membership driving voter admission, and ordered shutdown.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod agent;
mod auth;
mod error;
mod service;

pub use agent::{Agent, AgentConfig};
pub use auth::{authenticate, subject_of, AclAuthorizer, Authorizer, Subject};
pub use error::{ServerError, ServerResult};
pub use service::{CommitLog, LogService, ServerLister, StaticServerLister};
