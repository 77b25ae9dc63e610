//! The replicated state machine.
//!
//! Consensus requires three callbacks: apply a committed command, produce
//! a snapshot, restore from one. [`LogStateMachine`] implements them over
//! the local data log: commands are prost-encoded records to append,
//! snapshots are the log's concatenated store stream, and restore rebuilds
//! the log frame by frame so the offset sequence matches the snapshot
//! source exactly.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use prost::Message as _;
use quill_api::Record;
use quill_log::{Log, LEN_WIDTH};
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};

/// The callbacks consensus drives.
///
/// Implementations are chosen at wiring time; the runtime holds a
/// `dyn StateMachine` so tests can substitute their own.
pub trait StateMachine: Send + Sync + 'static {
    /// Applies one committed command; the returned bytes travel back to
    /// the proposer on the leader.
    ///
    /// # Errors
    /// An error refuses the command; consensus surfaces it to the
    /// proposer.
    fn apply(&self, term: u64, command: &[u8]) -> ClusterResult<Bytes>;

    /// Opens a snapshot stream of the current applied state.
    ///
    /// # Errors
    /// Returns an error if the state cannot be snapshotted.
    fn snapshot(&self) -> ClusterResult<Box<dyn Read + Send>>;

    /// Replaces the applied state with the snapshot stream's contents.
    ///
    /// # Errors
    /// Returns an error if the stream is malformed or the rebuild fails.
    fn restore(&self, snapshot: &mut dyn Read) -> ClusterResult<()>;
}

/// The production state machine: applies append commands to the local
/// data log.
pub struct LogStateMachine {
    log: Arc<Log>,
}

impl LogStateMachine {
    /// Wraps the local data log.
    #[must_use]
    pub const fn new(log: Arc<Log>) -> Self {
        Self { log }
    }
}

impl StateMachine for LogStateMachine {
    fn apply(&self, term: u64, command: &[u8]) -> ClusterResult<Bytes> {
        let mut record = Record::decode(command).map_err(|_| ClusterError::Corrupt {
            what: "append command",
        })?;
        record.term = term;

        let offset = self.log.append(record)?;
        Ok(Bytes::copy_from_slice(&offset.to_be_bytes()))
    }

    fn snapshot(&self) -> ClusterResult<Box<dyn Read + Send>> {
        Ok(Box::new(self.log.reader()))
    }

    fn restore(&self, snapshot: &mut dyn Read) -> ClusterResult<()> {
        let mut reset = false;
        let mut len_buf = [0u8; LEN_WIDTH as usize];

        loop {
            match snapshot.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(ClusterError::io("snapshot read", e)),
            }
            let len = usize::try_from(u64::from_be_bytes(len_buf))
                .expect("snapshot frame fits in memory");

            let mut frame = vec![0u8; len];
            snapshot
                .read_exact(&mut frame)
                .map_err(|e| ClusterError::io("snapshot read", e))?;

            let record = Record::decode(frame.as_slice()).map_err(|_| ClusterError::Corrupt {
                what: "snapshot record",
            })?;

            // The first record fixes the offset space; everything after
            // must land sequentially on the same offsets.
            if !reset {
                debug!(first_offset = record.offset, "restoring log from snapshot");
                self.log.reset_to(record.offset)?;
                reset = true;
            }
            self.log.append(record)?;
        }

        if !reset {
            // An empty snapshot restores an empty log.
            self.log.reset()?;
        }
        Ok(())
    }
}
