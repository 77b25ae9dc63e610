//! The log: an ordered list of segments behind one reader-writer lock.
//!
//! Offsets form one densely-packed global space: reading offset `o`
//! succeeds iff `first.base_offset <= o < active.next_offset`. The active
//! segment is always the last one and the only writable one.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use quill_api::Record;
use tokio::sync::watch;
use tracing::debug;

use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::segment::Segment;
use crate::store::Store;

/// The segmented commit log.
///
/// Cheap to share: wrap in an [`Arc`] and call everything through `&self`.
/// Appends and truncations take the exclusive lock; reads share it.
pub struct Log {
    dir: PathBuf,
    config: LogConfig,
    /// Ordered by strictly increasing base offset; last is active.
    segments: RwLock<Vec<Segment>>,
    /// Publishes the next offset to be assigned; consumers waiting for
    /// offset `o` block until the published value exceeds `o`.
    next_offset_tx: watch::Sender<u64>,
}

impl Log {
    /// Opens the log in `dir`, rebuilding segments from the files found
    /// there, or creating the initial segment if the directory is empty.
    ///
    /// # Errors
    /// Returns an error if the directory or any segment cannot be opened.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> LogResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| LogError::io("log mkdir", e))?;

        let segments = Self::load_segments(&dir, &config)?;
        let next_offset = segments
            .last()
            .map_or(config.initial_offset, Segment::next_offset);
        let (next_offset_tx, _) = watch::channel(next_offset);

        debug!(dir = %dir.display(), segments = segments.len(), next_offset, "log opened");

        Ok(Self {
            dir,
            config,
            segments: RwLock::new(segments),
            next_offset_tx,
        })
    }

    /// Scans `dir` for segment files and opens them in base-offset order.
    fn load_segments(dir: &Path, config: &LogConfig) -> LogResult<Vec<Segment>> {
        // A BTreeSet both sorts and dedups the store/index pair.
        let mut bases = BTreeSet::new();
        let entries = std::fs::read_dir(dir).map_err(|e| LogError::io("log scan", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| LogError::io("log scan", e))?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(base) = stem.parse::<u64>() {
                bases.insert(base);
            }
        }

        let mut segments = Vec::with_capacity(bases.len().max(1));
        for base in &bases {
            segments.push(Segment::open(dir, *base, config)?);
        }
        if segments.is_empty() {
            segments.push(Segment::open(dir, config.initial_offset, config)?);
        }
        Ok(segments)
    }

    /// Appends a record to the active segment, rotating afterwards if the
    /// segment reached a threshold.
    ///
    /// Returns the assigned offset.
    ///
    /// # Errors
    /// Returns [`LogError::Closed`] after [`Log::close`], or any storage
    /// error from the append.
    pub fn append(&self, record: Record) -> LogResult<u64> {
        let mut segments = self.segments.write().expect("log lock poisoned");
        let active = segments.last_mut().ok_or(LogError::Closed)?;

        let offset = active.append(record)?;
        if active.is_maxed() {
            debug!(base_offset = offset + 1, "rotating segment");
            segments.push(Segment::open(&self.dir, offset + 1, &self.config)?);
        }

        self.next_offset_tx.send_replace(offset + 1);
        Ok(offset)
    }

    /// Reads the record at `offset`.
    ///
    /// # Errors
    /// Returns [`LogError::OffsetOutOfRange`] outside the readable range,
    /// or [`LogError::Closed`] after [`Log::close`].
    pub fn read(&self, offset: u64) -> LogResult<Record> {
        let segments = self.segments.read().expect("log lock poisoned");
        if segments.is_empty() {
            return Err(LogError::Closed);
        }

        segments
            .iter()
            .find(|s| s.base_offset() <= offset && offset < s.next_offset())
            .ok_or(LogError::OffsetOutOfRange { offset })?
            .read(offset)
    }

    /// The lowest readable offset.
    ///
    /// # Errors
    /// Returns [`LogError::Closed`] after [`Log::close`].
    pub fn lowest_offset(&self) -> LogResult<u64> {
        let segments = self.segments.read().expect("log lock poisoned");
        segments
            .first()
            .map(Segment::base_offset)
            .ok_or(LogError::Closed)
    }

    /// The highest written offset; zero when nothing was written yet.
    ///
    /// # Errors
    /// Returns [`LogError::Closed`] after [`Log::close`].
    pub fn highest_offset(&self) -> LogResult<u64> {
        let segments = self.segments.read().expect("log lock poisoned");
        let next = segments
            .last()
            .map(Segment::next_offset)
            .ok_or(LogError::Closed)?;
        Ok(next.saturating_sub(1))
    }

    /// Removes every segment whose records are all at or below `lowest`.
    ///
    /// Used after snapshotting to reclaim storage.
    ///
    /// # Errors
    /// Returns an error if removing a segment's files fails.
    pub fn truncate(&self, lowest: u64) -> LogResult<()> {
        let mut segments = self.segments.write().expect("log lock poisoned");
        let drained = std::mem::take(&mut *segments);
        for segment in drained {
            if segment.next_offset() <= lowest + 1 {
                segment.remove()?;
            } else {
                segments.push(segment);
            }
        }
        Ok(())
    }

    /// Returns a reader over the concatenated stores of every segment,
    /// in offset order. The stream is finite and non-restartable; it is
    /// how snapshots are produced.
    pub fn reader(&self) -> LogReader {
        let segments = self.segments.read().expect("log lock poisoned");
        let parts = segments
            .iter()
            .map(|s| {
                let store = s.store();
                let size = store.size();
                (store, size)
            })
            .collect();
        LogReader {
            parts,
            current: 0,
            pos: 0,
        }
    }

    /// Subscribes to the next-offset watch channel.
    ///
    /// The channel publishes the next offset to be assigned; a consumer
    /// waiting for offset `o` waits until the value exceeds `o`.
    #[must_use]
    pub fn watch_next_offset(&self) -> watch::Receiver<u64> {
        self.next_offset_tx.subscribe()
    }

    /// Flushes and closes every segment. Idempotent.
    ///
    /// # Errors
    /// Returns the first close error encountered.
    pub fn close(&self) -> LogResult<()> {
        let mut segments = self.segments.write().expect("log lock poisoned");
        for segment in segments.drain(..) {
            segment.close()?;
        }
        Ok(())
    }

    /// Closes the log and deletes its directory.
    ///
    /// # Errors
    /// Returns an error if closing or the directory removal fails.
    pub fn remove(&self) -> LogResult<()> {
        self.close()?;
        std::fs::remove_dir_all(&self.dir).map_err(|e| LogError::io("log remove", e))
    }

    /// Removes the log and recreates it empty at the configured initial
    /// offset.
    ///
    /// # Errors
    /// Returns an error if removal or recreation fails.
    pub fn reset(&self) -> LogResult<()> {
        self.reset_to(self.config.initial_offset)
    }

    /// Removes the log and recreates it empty with the given first
    /// offset. Snapshot restore uses this to adopt the snapshot source's
    /// offset space.
    ///
    /// # Errors
    /// Returns an error if removal or recreation fails.
    pub fn reset_to(&self, initial_offset: u64) -> LogResult<()> {
        let mut segments = self.segments.write().expect("log lock poisoned");
        for segment in segments.drain(..) {
            segment.close()?;
        }
        std::fs::remove_dir_all(&self.dir).map_err(|e| LogError::io("log remove", e))?;
        std::fs::create_dir_all(&self.dir).map_err(|e| LogError::io("log mkdir", e))?;

        let config = self.config.with_initial_offset(initial_offset);
        segments.push(Segment::open(&self.dir, initial_offset, &config)?);
        self.next_offset_tx.send_replace(initial_offset);
        Ok(())
    }

    /// The directory this log lives in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log").field("dir", &self.dir).finish()
    }
}

/// A finite byte stream over every segment's store, in order.
pub struct LogReader {
    parts: Vec<(Arc<Store>, u64)>,
    current: usize,
    pos: u64,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let Some((store, size)) = self.parts.get(self.current) else {
                return Ok(0);
            };
            if self.pos >= *size {
                self.current += 1;
                self.pos = 0;
                continue;
            }

            let remaining = usize::try_from(size - self.pos).unwrap_or(usize::MAX);
            let want = buf.len().min(remaining);
            let n = store
                .read_at(&mut buf[..want], self.pos)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            if n == 0 {
                // The store ended early; move on rather than spin.
                self.current += 1;
                self.pos = 0;
                continue;
            }
            self.pos += n as u64;
            return Ok(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LEN_WIDTH;
    use prost::Message;
    use quill_api::RecordKind;

    fn record(value: &str) -> Record {
        Record {
            value: value.as_bytes().to_vec(),
            offset: 0,
            term: 0,
            kind: RecordKind::Append as i32,
        }
    }

    #[test]
    fn test_append_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), LogConfig::default()).unwrap();

        let off = log.append(record("hello world")).unwrap();
        assert_eq!(off, 0);

        let got = log.read(0).unwrap();
        assert_eq!(got.value, b"hello world".to_vec());
        assert_eq!(got.offset, 0);
    }

    #[test]
    fn test_read_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), LogConfig::default()).unwrap();
        log.append(record("only")).unwrap();

        let err = log.read(1).unwrap_err();
        assert!(matches!(err, LogError::OffsetOutOfRange { offset: 1 }));
    }

    #[test]
    fn test_rotation_keeps_all_offsets_readable() {
        let dir = tempfile::tempdir().unwrap();
        // Small store threshold so the second append maxes the segment.
        let config = LogConfig::default().with_max_store_bytes(50);
        let log = Log::open(dir.path(), config).unwrap();

        for i in 0..3 {
            log.append(record("sixteen-byte-val")).unwrap();
            assert_eq!(log.highest_offset().unwrap(), i);
        }

        let segments = log.segments.read().unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].base_offset(), 2);
        drop(segments);

        for i in 0..3 {
            assert_eq!(log.read(i).unwrap().value, b"sixteen-byte-val".to_vec());
        }
    }

    #[test]
    fn test_reopen_recovers_offset_range() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::default();

        {
            let log = Log::open(dir.path(), config).unwrap();
            for i in 0..100 {
                log.append(record(&format!("value-{i}"))).unwrap();
            }
            log.close().unwrap();
        }

        let log = Log::open(dir.path(), config).unwrap();
        assert_eq!(log.lowest_offset().unwrap(), 0);
        assert_eq!(log.highest_offset().unwrap(), 99);
        for i in 0..100u64 {
            assert_eq!(log.read(i).unwrap().value, format!("value-{i}").into_bytes());
        }
    }

    #[test]
    fn test_truncate_removes_whole_segments() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::default().with_max_store_bytes(50);
        let log = Log::open(dir.path(), config).unwrap();

        for _ in 0..6 {
            log.append(record("sixteen-byte-val")).unwrap();
        }

        log.truncate(3).unwrap();

        assert!(log.read(0).unwrap_err().is_offset_out_of_range());
        assert!(log.read(3).unwrap_err().is_offset_out_of_range());
        assert!(log.read(4).is_ok());
        assert_eq!(log.highest_offset().unwrap(), 5);
    }

    #[test]
    fn test_reader_streams_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::default().with_max_store_bytes(50);
        let log = Log::open(dir.path(), config).unwrap();

        for i in 0..5 {
            log.append(record(&format!("value-{i}"))).unwrap();
        }

        let mut data = Vec::new();
        log.reader().read_to_end(&mut data).unwrap();

        // Walk the length-prefixed frames back out.
        let mut pos = 0usize;
        let mut offsets = Vec::new();
        while pos < data.len() {
            let len_bytes: [u8; 8] = data[pos..pos + LEN_WIDTH as usize].try_into().unwrap();
            let len = u64::from_be_bytes(len_bytes) as usize;
            pos += LEN_WIDTH as usize;
            let rec = Record::decode(&data[pos..pos + len]).unwrap();
            offsets.push(rec.offset);
            pos += len;
        }
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_initial_offset() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::default().with_initial_offset(1);
        let log = Log::open(dir.path(), config).unwrap();

        assert_eq!(log.append(record("first")).unwrap(), 1);
        assert_eq!(log.lowest_offset().unwrap(), 1);
    }

    #[test]
    fn test_closed_log_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), LogConfig::default()).unwrap();
        log.append(record("x")).unwrap();
        log.close().unwrap();

        assert!(matches!(log.append(record("y")), Err(LogError::Closed)));
        assert!(matches!(log.read(0), Err(LogError::Closed)));
        // Close is idempotent.
        log.close().unwrap();
    }

    #[test]
    fn test_reset_to_adopts_new_offset_space() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path(), LogConfig::default()).unwrap();
        log.append(record("old")).unwrap();

        log.reset_to(40).unwrap();
        assert_eq!(log.append(record("new")).unwrap(), 40);
        assert!(log.read(0).unwrap_err().is_offset_out_of_range());
    }
}
