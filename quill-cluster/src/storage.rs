//! File-backed raft storage.
//!
//! Three stores live under `<data_dir>/raft/`:
//!
//! - `log/` — raft entries in a second segmented [`Log`] (entries start
//!   at index 1, so the log's initial offset is 1); the record's `term`
//!   and `kind` fields carry the raft metadata
//! - `stable.json` — the hard state (current term, vote)
//! - `snapshots/` — `<term>-<index>.snap` payloads with `.meta` JSON
//!   sidecars, checksummed with crc32

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use quill_api::{Record, RecordKind};
use quill_core::{LogIndex, ServerId, Term};
use quill_log::{Log, LogConfig};
use quill_raft::{
    Configuration, Entry, EntryKind, HardState, LogStore, Server, SnapshotMeta, SnapshotSource,
    SnapshotStore, StableStore, StorageError, StorageResult,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Raft log entries persisted in a segmented log.
pub struct SegmentedLogStore {
    log: Arc<Log>,
}

impl SegmentedLogStore {
    /// Opens the store in `dir`. Raft indexes are 1-based, so the
    /// backing log starts at offset 1.
    ///
    /// # Errors
    /// Returns an error if the log cannot be opened.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> StorageResult<Self> {
        let log = Log::open(dir, config.with_initial_offset(1))
            .map_err(|e| io_from_log("raft log open", &e))?;
        Ok(Self { log: Arc::new(log) })
    }

    /// Drops everything and restarts the sequence at `next_index`
    /// (after a snapshot install).
    ///
    /// # Errors
    /// Returns an error if the reset fails.
    pub fn reset(&self, next_index: LogIndex) -> StorageResult<()> {
        self.log
            .reset_to(next_index.get())
            .map_err(|e| io_from_log("raft log reset", &e))
    }

    /// Flushes and closes the backing log.
    ///
    /// # Errors
    /// Returns an error if the close fails.
    pub fn close(&self) -> StorageResult<()> {
        self.log
            .close()
            .map_err(|e| io_from_log("raft log close", &e))
    }

    fn bounds(&self) -> StorageResult<(u64, u64)> {
        let lowest = self
            .log
            .lowest_offset()
            .map_err(|e| io_from_log("raft log bounds", &e))?;
        let highest = self
            .log
            .highest_offset()
            .map_err(|e| io_from_log("raft log bounds", &e))?;
        Ok((lowest, highest))
    }
}

impl LogStore for SegmentedLogStore {
    fn last_index(&self) -> StorageResult<LogIndex> {
        let (_, highest) = self.bounds()?;
        Ok(LogIndex::new(highest))
    }

    fn is_empty(&self) -> StorageResult<bool> {
        let (lowest, highest) = self.bounds()?;
        Ok(highest < lowest)
    }

    fn entries_from(&self, from: LogIndex) -> StorageResult<Vec<Entry>> {
        let (lowest, highest) = self.bounds()?;
        if highest < lowest {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for index in from.get().max(lowest)..=highest {
            let record = self
                .log
                .read(index)
                .map_err(|e| io_from_log("raft log read", &e))?;
            entries.push(entry_from_record(record)?);
        }
        Ok(entries)
    }

    fn append(&self, entries: &[Entry]) -> StorageResult<()> {
        for entry in entries {
            let assigned = self
                .log
                .append(record_from_entry(entry))
                .map_err(|e| io_from_log("raft log append", &e))?;
            if assigned != entry.index.get() {
                return Err(StorageError::Corrupt {
                    what: "raft log index drifted from entry index",
                });
            }
        }
        Ok(())
    }

    fn truncate_suffix(&self, from: LogIndex) -> StorageResult<()> {
        let (lowest, highest) = self.bounds()?;
        if highest < lowest || from.get() > highest {
            return Ok(());
        }

        // The segmented log only drops whole old segments, so a suffix
        // truncation rebuilds the kept prefix. Conflicts are rare and the
        // kept window is small.
        let mut keep = Vec::new();
        for index in lowest..from.get() {
            keep.push(
                self.log
                    .read(index)
                    .map_err(|e| io_from_log("raft log read", &e))?,
            );
        }

        debug!(from = from.get(), kept = keep.len(), "truncating raft log suffix");
        self.log
            .reset_to(lowest)
            .map_err(|e| io_from_log("raft log reset", &e))?;
        for record in keep {
            self.log
                .append(record)
                .map_err(|e| io_from_log("raft log append", &e))?;
        }
        Ok(())
    }

    fn truncate_prefix(&self, through: LogIndex) -> StorageResult<()> {
        self.log
            .truncate(through.get())
            .map_err(|e| io_from_log("raft log truncate", &e))
    }
}

fn record_from_entry(entry: &Entry) -> Record {
    Record {
        value: entry.data.to_vec(),
        offset: entry.index.get(),
        term: entry.term.get(),
        kind: match entry.kind {
            EntryKind::Command => RecordKind::Append,
            EntryKind::Configuration => RecordKind::Configuration,
            EntryKind::Noop => RecordKind::Noop,
        } as i32,
    }
}

fn entry_from_record(record: Record) -> StorageResult<Entry> {
    let kind = match RecordKind::try_from(record.kind) {
        Ok(RecordKind::Append) => EntryKind::Command,
        Ok(RecordKind::Configuration) => EntryKind::Configuration,
        Ok(RecordKind::Noop) => EntryKind::Noop,
        Err(_) => {
            return Err(StorageError::Corrupt {
                what: "raft record kind",
            })
        }
    };
    Ok(Entry::new(
        Term::new(record.term),
        LogIndex::new(record.offset),
        kind,
        Bytes::from(record.value),
    ))
}

fn io_from_log(operation: &'static str, err: &quill_log::LogError) -> StorageError {
    StorageError::io(
        operation,
        std::io::Error::other(err.to_string()),
    )
}

/// Hard state persisted as a small JSON file.
pub struct FileStableStore {
    path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct PersistedHardState {
    term: u64,
    voted_for: Option<String>,
}

impl FileStableStore {
    /// Uses (or creates on first save) the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StableStore for FileStableStore {
    fn load(&self) -> StorageResult<Option<HardState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes =
            std::fs::read(&self.path).map_err(|e| StorageError::io("stable read", e))?;
        let persisted: PersistedHardState =
            serde_json::from_slice(&bytes).map_err(|_| StorageError::Corrupt {
                what: "stable store",
            })?;
        Ok(Some(HardState {
            term: Term::new(persisted.term),
            voted_for: persisted.voted_for.map(ServerId::new),
        }))
    }

    fn save(&self, state: &HardState) -> StorageResult<()> {
        let persisted = PersistedHardState {
            term: state.term.get(),
            voted_for: state.voted_for.as_ref().map(|id| id.as_str().to_string()),
        };
        let bytes = serde_json::to_vec(&persisted).expect("hard state serializes");
        std::fs::write(&self.path, bytes).map_err(|e| StorageError::io("stable write", e))
    }
}

/// Snapshot archives on disk, newest kept, older ones pruned.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct MetaFile {
    last_index: u64,
    last_term: u64,
    crc32: u32,
    servers: Vec<MetaServer>,
}

#[derive(Serialize, Deserialize)]
struct MetaServer {
    id: String,
    addr: String,
}

impl FileSnapshotStore {
    /// Opens (creating if needed) the snapshot directory.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io("snapshot mkdir", e))?;
        Ok(Self { dir })
    }

    fn base_name(meta: &SnapshotMeta) -> String {
        format!("{:020}-{:020}", meta.last_term.get(), meta.last_index.get())
    }

    fn prune_except(&self, keep: &str) -> StorageResult<()> {
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| StorageError::io("snapshot scan", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("snapshot scan", e))?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem != keep {
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn create(&self, meta: &SnapshotMeta, data: &mut dyn Read) -> StorageResult<()> {
        let mut payload = Vec::new();
        data.read_to_end(&mut payload)
            .map_err(|e| StorageError::io("snapshot read", e))?;

        let base = Self::base_name(meta);
        let meta_file = MetaFile {
            last_index: meta.last_index.get(),
            last_term: meta.last_term.get(),
            crc32: crc32fast::hash(&payload),
            servers: meta
                .configuration
                .servers
                .iter()
                .map(|s| MetaServer {
                    id: s.id.as_str().to_string(),
                    addr: s.addr.clone(),
                })
                .collect(),
        };

        std::fs::write(self.dir.join(format!("{base}.snap")), &payload)
            .map_err(|e| StorageError::io("snapshot write", e))?;
        std::fs::write(
            self.dir.join(format!("{base}.meta")),
            serde_json::to_vec(&meta_file).expect("snapshot meta serializes"),
        )
        .map_err(|e| StorageError::io("snapshot write", e))?;

        debug!(
            last_index = meta.last_index.get(),
            bytes = payload.len(),
            "snapshot persisted"
        );
        self.prune_except(&base)
    }

    fn latest(&self) -> StorageResult<Option<SnapshotSource>> {
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| StorageError::io("snapshot scan", e))?;

        let mut newest: Option<(u64, PathBuf, MetaFile)> = None;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("snapshot scan", e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let bytes =
                std::fs::read(&path).map_err(|e| StorageError::io("snapshot read", e))?;
            let Ok(meta) = serde_json::from_slice::<MetaFile>(&bytes) else {
                continue; // skip a torn meta, an older snapshot may be fine
            };
            if newest.as_ref().map_or(true, |(idx, _, _)| meta.last_index > *idx) {
                newest = Some((meta.last_index, path, meta));
            }
        }

        let Some((_, meta_path, meta_file)) = newest else {
            return Ok(None);
        };

        let payload = std::fs::read(meta_path.with_extension("snap"))
            .map_err(|e| StorageError::io("snapshot read", e))?;
        if crc32fast::hash(&payload) != meta_file.crc32 {
            return Err(StorageError::Corrupt {
                what: "snapshot checksum",
            });
        }

        let meta = SnapshotMeta {
            last_index: LogIndex::new(meta_file.last_index),
            last_term: Term::new(meta_file.last_term),
            configuration: Configuration {
                servers: meta_file
                    .servers
                    .into_iter()
                    .map(|s| Server {
                        id: ServerId::new(s.id),
                        addr: s.addr,
                    })
                    .collect(),
            },
        };
        let reader: Box<dyn Read + Send> = Box::new(std::io::Cursor::new(payload));
        Ok(Some((meta, reader)))
    }
}
