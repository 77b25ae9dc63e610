//! Segment management.
//!
//! A segment pairs one store file with one index file under a shared base
//! offset. The files are named by the base offset, zero-padded so a
//! lexical directory listing is also the offset order:
//!
//! ```text
//! 00000000000000000000.store
//! 00000000000000000000.index
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use prost::Message;
use quill_api::Record;

use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::index::Index;
use crate::store::Store;

/// One (store, index) pair spanning `[base_offset, next_offset)`.
#[derive(Debug)]
pub struct Segment {
    store: Arc<Store>,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    config: LogConfig,
    store_path: PathBuf,
    index_path: PathBuf,
}

impl Segment {
    /// Opens (or creates) the segment with the given base offset in `dir`.
    ///
    /// `next_offset` is recovered from the index: one past the last
    /// relative entry, or the base offset for a fresh segment.
    ///
    /// # Errors
    /// Returns an error if either file cannot be opened.
    pub fn open(dir: impl AsRef<Path>, base_offset: u64, config: &LogConfig) -> LogResult<Self> {
        let dir = dir.as_ref();
        let store_path = dir.join(format!("{base_offset:020}.store"));
        let index_path = dir.join(format!("{base_offset:020}.index"));

        let store = Arc::new(Store::open(&store_path)?);
        let index = Index::open(&index_path, config.max_index_bytes)?;

        let next_offset = match index.read(-1) {
            Ok((rel, _)) => base_offset + u64::from(rel) + 1,
            Err(LogError::Eof) => base_offset,
            Err(e) => return Err(e),
        };

        Ok(Self {
            store,
            index,
            base_offset,
            next_offset,
            config: *config,
            store_path,
            index_path,
        })
    }

    /// Appends a record, stamping it with the next offset.
    ///
    /// Returns the assigned offset.
    ///
    /// # Errors
    /// Returns an error if the store write or index write fails; an
    /// [`LogError::Eof`] from the index means the segment is maxed.
    pub fn append(&mut self, mut record: Record) -> LogResult<u64> {
        let offset = self.next_offset;
        record.offset = offset;

        let frame = record.encode_to_vec();
        let (_, pos) = self.store.append(&frame)?;

        // rel_offset fits in u32: a segment cannot hold more entries than
        // max_index_bytes / ENTRY_WIDTH, which is far below u32::MAX.
        #[allow(clippy::cast_possible_truncation)]
        self.index.write((offset - self.base_offset) as u32, pos)?;

        self.next_offset += 1;
        Ok(offset)
    }

    /// Reads the record at the given absolute offset.
    ///
    /// # Errors
    /// Returns an error if the offset has no index entry or the frame
    /// fails to decode.
    pub fn read(&self, offset: u64) -> LogResult<Record> {
        let rel = i64::try_from(offset - self.base_offset).expect("relative offset fits i64");
        let (_, pos) = self.index.read(rel)?;
        let frame = self.store.read(pos)?;
        Record::decode(frame).map_err(|source| LogError::Corrupt {
            position: pos,
            source,
        })
    }

    /// Returns true once either file has reached its threshold.
    #[must_use]
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes || self.index.is_maxed()
    }

    /// The first offset this segment can contain.
    #[must_use]
    pub const fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// One past the highest offset written to this segment.
    #[must_use]
    pub const fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// A handle to the segment's store, for snapshot readers.
    #[must_use]
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Flushes and syncs both files.
    ///
    /// # Errors
    /// Returns an error if either file fails to sync.
    pub fn close(self) -> LogResult<()> {
        self.index.close()?;
        self.store.close()
    }

    /// Closes the segment and unlinks both files.
    ///
    /// # Errors
    /// Returns an error if closing or unlinking fails.
    pub fn remove(self) -> LogResult<()> {
        let store_path = self.store_path.clone();
        let index_path = self.index_path.clone();
        self.close()?;
        std::fs::remove_file(index_path).map_err(|e| LogError::io("index unlink", e))?;
        std::fs::remove_file(store_path).map_err(|e| LogError::io("store unlink", e))
    }
}
