//! Quill Log - the segmented, append-only commit log storage engine.
//!
//! Records live in rotating segments. Each segment pairs an append-only
//! *store* file (length-prefixed record frames) with a memory-mapped
//! *index* file (fixed-width entries mapping a record's relative offset to
//! its byte position in the store). The [`Log`] stitches segments into one
//! densely-packed global offset space.
//!
//! # Design Principles
//!
//! - **Crash safety**: the index is synced and truncated to its logical
//!   size on close; reopening a directory rebuilds the exact offset range
//! - **Explicit limits**: segments rotate at configured size thresholds
//! - **Readers never block readers**: one reader-writer lock over the
//!   segment list; appends and truncations are exclusive
//!
//! # Example
//!
//! ```ignore
//! use quill_log::{Log, LogConfig};
//! use quill_api::Record;
//!
//! let log = Log::open("/var/lib/quill/log", LogConfig::default())?;
//! let offset = log.append(Record { value: b"hello".to_vec(), ..Default::default() })?;
//! let record = log.read(offset)?;
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod config;
mod error;
mod index;
mod log;
mod segment;
mod store;

pub use config::LogConfig;
pub use error::{LogError, LogResult};
pub use index::{Index, ENTRY_WIDTH};
pub use log::{Log, LogReader};
pub use segment::Segment;
pub use store::{Store, LEN_WIDTH};
