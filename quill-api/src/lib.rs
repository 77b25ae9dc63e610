//! Quill API - wire types and gRPC service definitions.
//!
//! The `log.v1` protobuf package compiled by `tonic-build` (see
//! `build.rs`). Everything the other crates need is re-exported from the
//! crate root so callers do not have to spell out the generated paths.

#![deny(clippy::all)]

/// Code generated from `proto/log.proto`.
#[allow(clippy::all, clippy::pedantic, missing_docs)]
pub mod generated;

pub use generated::log_client::LogClient;
pub use generated::log_server::{Log, LogServer};
pub use generated::{
    ConsumeRequest, ConsumeResponse, GetServersRequest, GetServersResponse, ProduceRequest,
    ProduceResponse, Record, RecordKind, Server,
};
