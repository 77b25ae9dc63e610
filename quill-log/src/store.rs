//! The append-only store file.
//!
//! A store is a flat sequence of frames written sequentially:
//!
//! ```text
//! +-----------------+------------------+-----------------+---
//! | len (u64, BE)   | payload (N bytes)| len (u64, BE)   | ...
//! +-----------------+------------------+-----------------+---
//! ```
//!
//! The position handed back by [`Store::append`] is the byte offset of the
//! frame's length prefix; that position is what the index records.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;

use crate::error::{LogError, LogResult};

/// Width of the big-endian length prefix on every frame.
pub const LEN_WIDTH: u64 = 8;

/// Appends are staged here before hitting the file.
const WRITE_BUF_CAPACITY: usize = 8 * 1024;

struct Inner {
    file: File,
    /// Appended bytes not yet written to the file.
    buf: Vec<u8>,
    /// Logical size: file size plus buffered bytes.
    size: u64,
}

/// An append-only byte store with buffered writes.
///
/// A single mutex protects the buffer and the size; reads serialize with
/// writes because a read must flush the buffer first to see every frame.
pub struct Store {
    inner: Mutex<Inner>,
    path: PathBuf,
}

impl Store {
    /// Opens (or creates) the store file at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or its size read.
    pub fn open(path: impl AsRef<Path>) -> LogResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| LogError::io("store open", e))?;
        let size = file
            .metadata()
            .map_err(|e| LogError::io("store stat", e))?
            .len();

        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                buf: Vec::with_capacity(WRITE_BUF_CAPACITY),
                size,
            }),
            path,
        })
    }

    /// Appends `payload` as one frame.
    ///
    /// Returns `(bytes_written, position)` where `position` is the byte
    /// offset of the frame's length prefix and `bytes_written` includes
    /// the prefix.
    ///
    /// # Errors
    /// Returns an error if flushing the write buffer fails.
    pub fn append(&self, payload: &[u8]) -> LogResult<(u64, u64)> {
        let mut inner = self.inner.lock().expect("store lock poisoned");

        let pos = inner.size;
        inner.buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        inner.buf.extend_from_slice(payload);

        let written = LEN_WIDTH + payload.len() as u64;
        inner.size += written;

        if inner.buf.len() >= WRITE_BUF_CAPACITY {
            Self::flush_locked(&mut inner)?;
        }

        Ok((written, pos))
    }

    /// Reads the frame whose length prefix starts at `pos`.
    ///
    /// # Errors
    /// Returns an error on I/O failure, including reads past the end.
    pub fn read(&self, pos: u64) -> LogResult<Bytes> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        Self::flush_locked(&mut inner)?;

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        inner
            .file
            .read_exact_at(&mut len_buf, pos)
            .map_err(|e| LogError::io("store read length", e))?;
        let len = u64::from_be_bytes(len_buf);

        let mut payload = vec![0u8; usize::try_from(len).expect("frame larger than memory")];
        inner
            .file
            .read_exact_at(&mut payload, pos + LEN_WIDTH)
            .map_err(|e| LogError::io("store read payload", e))?;

        Ok(Bytes::from(payload))
    }

    /// Reads up to `buf.len()` bytes starting at absolute offset `off`.
    ///
    /// Flushes buffered writes first, then delegates to the file. Returns
    /// the number of bytes read; zero signals end of store.
    ///
    /// # Errors
    /// Returns an error if flushing or the positioned read fails.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> LogResult<usize> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        Self::flush_locked(&mut inner)?;

        inner
            .file
            .read_at(buf, off)
            .map_err(|e| LogError::io("store read_at", e))
    }

    /// Returns the logical size in bytes, including buffered appends.
    pub fn size(&self) -> u64 {
        self.inner.lock().expect("store lock poisoned").size
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes buffered appends and syncs file contents to disk.
    ///
    /// # Errors
    /// Returns an error if the flush or sync fails.
    pub fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        Self::flush_locked(&mut inner)?;
        inner
            .file
            .sync_data()
            .map_err(|e| LogError::io("store sync", e))
    }

    fn flush_locked(inner: &mut Inner) -> LogResult<()> {
        if inner.buf.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut inner.buf);
        inner
            .file
            .write_all(&buf)
            .map_err(|e| LogError::io("store flush", e))?;
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"hello world";
    const FRAME_WIDTH: u64 = LEN_WIDTH + PAYLOAD.len() as u64;

    #[test]
    fn test_append_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("append_read.store")).unwrap();

        for i in 0..3u64 {
            let (written, pos) = store.append(PAYLOAD).unwrap();
            assert_eq!(written, FRAME_WIDTH);
            assert_eq!(pos, i * FRAME_WIDTH);
        }

        for i in 0..3u64 {
            let read = store.read(i * FRAME_WIDTH).unwrap();
            assert_eq!(&read[..], PAYLOAD);
        }
    }

    #[test]
    fn test_read_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("read_at.store")).unwrap();
        store.append(PAYLOAD).unwrap();

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        let n = store.read_at(&mut len_buf, 0).unwrap();
        assert_eq!(n, LEN_WIDTH as usize);
        assert_eq!(u64::from_be_bytes(len_buf), PAYLOAD.len() as u64);

        let mut payload = vec![0u8; PAYLOAD.len()];
        let n = store.read_at(&mut payload, LEN_WIDTH).unwrap();
        assert_eq!(n, PAYLOAD.len());
        assert_eq!(&payload[..], PAYLOAD);
    }

    #[test]
    fn test_reopen_preserves_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.store");

        {
            let store = Store::open(&path).unwrap();
            store.append(PAYLOAD).unwrap();
            store.close().unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.size(), FRAME_WIDTH);
        assert_eq!(&store.read(0).unwrap()[..], PAYLOAD);
    }

    #[test]
    fn test_read_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("past_end.store")).unwrap();
        store.append(PAYLOAD).unwrap();

        assert!(store.read(FRAME_WIDTH).is_err());
    }
}
