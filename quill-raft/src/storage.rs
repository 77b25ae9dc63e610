//! Storage traits the raft runtime persists through.
//!
//! The node itself never touches these; the runtime executes the node's
//! persistence outputs against them. Production implementations live in
//! `quill-cluster` (segmented log store, JSON stable store, file snapshot
//! store); [`MemoryStore`] backs the tests.

use std::io::Read;
use std::sync::Mutex;

use quill_core::{LogIndex, ServerId, Term};
use thiserror::Error;

use crate::entry::{Configuration, Entry};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O failure in the backing store.
    #[error("storage I/O error: {operation}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Stored state could not be decoded.
    #[error("corrupt storage state: {what}")]
    Corrupt {
        /// What failed to decode.
        what: &'static str,
    },
}

impl StorageError {
    /// Creates an I/O error tagged with the failing operation.
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }
}

/// Term and vote that must survive restarts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HardState {
    /// Current term.
    pub term: Term,
    /// Who we voted for in the current term, if anyone.
    pub voted_for: Option<ServerId>,
}

/// Durable storage for raft log entries.
pub trait LogStore: Send + Sync {
    /// The highest stored index, 0 when empty.
    fn last_index(&self) -> StorageResult<LogIndex>;

    /// True when no entry has ever been stored.
    fn is_empty(&self) -> StorageResult<bool>;

    /// Every stored entry with index >= `from`, in order.
    fn entries_from(&self, from: LogIndex) -> StorageResult<Vec<Entry>>;

    /// Appends entries; indexes must continue the stored sequence.
    fn append(&self, entries: &[Entry]) -> StorageResult<()>;

    /// Deletes every entry with index >= `from` (conflict resolution).
    fn truncate_suffix(&self, from: LogIndex) -> StorageResult<()>;

    /// Deletes every entry with index <= `through` (snapshot compaction).
    fn truncate_prefix(&self, through: LogIndex) -> StorageResult<()>;
}

/// Durable storage for the hard state.
pub trait StableStore: Send + Sync {
    /// Loads the persisted hard state, if any.
    fn load(&self) -> StorageResult<Option<HardState>>;

    /// Persists the hard state.
    fn save(&self, state: &HardState) -> StorageResult<()>;
}

/// Metadata describing one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Index of the last entry the snapshot covers.
    pub last_index: LogIndex,
    /// Term of that entry.
    pub last_term: Term,
    /// The cluster configuration at the snapshot point.
    pub configuration: Configuration,
}

/// A snapshot's metadata paired with a reader over its payload.
pub type SnapshotSource = (SnapshotMeta, Box<dyn Read + Send>);

/// Durable storage for snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Persists a snapshot, consuming the data stream.
    fn create(&self, meta: &SnapshotMeta, data: &mut dyn Read) -> StorageResult<()>;

    /// Opens the most recent snapshot, if any.
    fn latest(&self) -> StorageResult<Option<SnapshotSource>>;
}

/// In-memory implementation of all three stores, for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: Vec<Entry>,
    hard_state: Option<HardState>,
    snapshot: Option<(SnapshotMeta, Vec<u8>)>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryStore {
    fn last_index(&self) -> StorageResult<LogIndex> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.entries.last().map_or(LogIndex::new(0), |e| e.index))
    }

    fn is_empty(&self) -> StorageResult<bool> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.entries.is_empty())
    }

    fn entries_from(&self, from: LogIndex) -> StorageResult<Vec<Entry>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.index >= from)
            .cloned()
            .collect())
    }

    fn append(&self, entries: &[Entry]) -> StorageResult<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_suffix(&self, from: LogIndex) -> StorageResult<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.entries.retain(|e| e.index < from);
        Ok(())
    }

    fn truncate_prefix(&self, through: LogIndex) -> StorageResult<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.entries.retain(|e| e.index > through);
        Ok(())
    }
}

impl StableStore for MemoryStore {
    fn load(&self) -> StorageResult<Option<HardState>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.hard_state.clone())
    }

    fn save(&self, state: &HardState) -> StorageResult<()> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.hard_state = Some(state.clone());
        Ok(())
    }
}

impl SnapshotStore for MemoryStore {
    fn create(&self, meta: &SnapshotMeta, data: &mut dyn Read) -> StorageResult<()> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)
            .map_err(|e| StorageError::io("snapshot read", e))?;
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.snapshot = Some((meta.clone(), bytes));
        Ok(())
    }

    fn latest(&self) -> StorageResult<Option<SnapshotSource>> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.snapshot.clone().map(|(meta, bytes)| {
            let reader: Box<dyn Read + Send> = Box::new(std::io::Cursor::new(bytes));
            (meta, reader)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;
    use bytes::Bytes;

    #[test]
    fn test_memory_log_store() {
        let store = MemoryStore::new();
        assert!(store.is_empty().unwrap());

        let entries: Vec<Entry> = (1..=3)
            .map(|i| {
                Entry::new(
                    Term::new(1),
                    LogIndex::new(i),
                    EntryKind::Command,
                    Bytes::from("x"),
                )
            })
            .collect();
        store.append(&entries).unwrap();

        assert_eq!(store.last_index().unwrap(), LogIndex::new(3));
        assert_eq!(store.entries_from(LogIndex::new(2)).unwrap().len(), 2);

        store.truncate_suffix(LogIndex::new(3)).unwrap();
        assert_eq!(store.last_index().unwrap(), LogIndex::new(2));

        store.truncate_prefix(LogIndex::new(1)).unwrap();
        assert_eq!(store.entries_from(LogIndex::new(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_stable_store() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());

        let hs = HardState {
            term: Term::new(4),
            voted_for: Some(ServerId::new("node-1")),
        };
        store.save(&hs).unwrap();
        assert_eq!(store.load().unwrap(), Some(hs));
    }

    #[test]
    fn test_memory_snapshot_store() {
        let store = MemoryStore::new();
        let meta = SnapshotMeta {
            last_index: LogIndex::new(9),
            last_term: Term::new(2),
            configuration: Configuration::single(ServerId::new("a"), "addr".into()),
        };
        store
            .create(&meta, &mut std::io::Cursor::new(b"snapshot-bytes".to_vec()))
            .unwrap();

        let (got_meta, mut reader) = store.latest().unwrap().unwrap();
        assert_eq!(got_meta, meta);
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"snapshot-bytes");
    }
}
