//! Quill Client - cluster-aware access to the log service.
//!
//! The [`Resolver`] keeps a fresh view of the cluster by polling
//! `GetServers` on a seed endpoint; the [`Picker`] turns that view into
//! routing decisions (produces to the leader, consumes round-robin
//! across followers); [`ClusterClient`] glues both to per-server
//! connections. Everything is wired at construction time — there is no
//! process-global registry to register resolvers into.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod error;
mod picker;
mod resolver;

pub use error::{ClientError, ClientResult};
pub use picker::{ClusterClient, Picker};
pub use resolver::Resolver;
