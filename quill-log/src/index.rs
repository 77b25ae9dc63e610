//! The memory-mapped index file.
//!
//! Fixed-width entries map a record's offset *relative to the segment's
//! base* to the record's byte position in the store:
//!
//! ```text
//! +---------------------+--------------------+
//! | rel_offset (u32 BE) | position (u64 BE)  |
//! +---------------------+--------------------+
//! ```
//!
//! The backing file is pre-allocated to its maximum size up front and
//! memory-mapped shared read/write: offset lookup is the hot read path and
//! the map removes per-read syscall overhead, while pre-allocation avoids
//! growing the map under load. On close the file is truncated back to the
//! logical size so a reopen never sees phantom zero entries.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{LogError, LogResult};

/// Width of one index entry: u32 relative offset + u64 position.
pub const ENTRY_WIDTH: u64 = 12;

/// Width of the relative-offset field.
const OFF_WIDTH: u64 = 4;

/// The offset → store-position table for one segment.
pub struct Index {
    file: File,
    mmap: MmapMut,
    /// Logical used bytes; always a multiple of [`ENTRY_WIDTH`].
    size: u64,
    path: PathBuf,
}

impl Index {
    /// Opens (or creates) the index at `path`, pre-allocated to
    /// `max_index_bytes`.
    ///
    /// The logical size is taken from the file's length before
    /// pre-allocation, which is exact because [`Index::close`] truncates.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, sized, or mapped.
    #[allow(unsafe_code)] // the map itself; sound while `file` stays private to this struct
    pub fn open(path: impl AsRef<Path>, max_index_bytes: u64) -> LogResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| LogError::io("index open", e))?;

        let size = file
            .metadata()
            .map_err(|e| LogError::io("index stat", e))?
            .len();
        file.set_len(max_index_bytes)
            .map_err(|e| LogError::io("index preallocate", e))?;

        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| LogError::io("index mmap", e))?;

        Ok(Self {
            file,
            mmap,
            size,
            path,
        })
    }

    /// Reads the entry at logical position `at`, where `-1` selects the
    /// last entry.
    ///
    /// Returns `(relative_offset, store_position)`.
    ///
    /// # Errors
    /// Returns [`LogError::Eof`] when the index is empty or `at` is past
    /// the last entry.
    pub fn read(&self, at: i64) -> LogResult<(u32, u64)> {
        if self.size == 0 {
            return Err(LogError::Eof);
        }

        let entry = if at == -1 {
            (self.size / ENTRY_WIDTH) - 1
        } else {
            u64::try_from(at).map_err(|_| LogError::Eof)?
        };

        let pos = entry * ENTRY_WIDTH;
        if self.size < pos + ENTRY_WIDTH {
            return Err(LogError::Eof);
        }

        let pos = usize::try_from(pos).expect("index larger than memory");
        let off_width = OFF_WIDTH as usize;
        let ent_width = ENTRY_WIDTH as usize;

        let rel = u32::from_be_bytes(
            self.mmap[pos..pos + off_width]
                .try_into()
                .expect("slice width is 4"),
        );
        let position = u64::from_be_bytes(
            self.mmap[pos + off_width..pos + ent_width]
                .try_into()
                .expect("slice width is 8"),
        );
        Ok((rel, position))
    }

    /// Appends an entry.
    ///
    /// # Errors
    /// Returns [`LogError::Eof`] when no further entry fits in the map.
    pub fn write(&mut self, rel_offset: u32, position: u64) -> LogResult<()> {
        if self.is_maxed() {
            return Err(LogError::Eof);
        }

        let pos = usize::try_from(self.size).expect("index larger than memory");
        let off_width = OFF_WIDTH as usize;
        let ent_width = ENTRY_WIDTH as usize;

        self.mmap[pos..pos + off_width].copy_from_slice(&rel_offset.to_be_bytes());
        self.mmap[pos + off_width..pos + ent_width].copy_from_slice(&position.to_be_bytes());
        self.size += ENTRY_WIDTH;
        Ok(())
    }

    /// Returns true when no further entry fits.
    #[must_use]
    pub fn is_maxed(&self) -> bool {
        (self.mmap.len() as u64) < self.size + ENTRY_WIDTH
    }

    /// Returns the number of entries.
    #[must_use]
    pub const fn entries(&self) -> u64 {
        self.size / ENTRY_WIDTH
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Syncs the map and the file, then truncates the file to the logical
    /// size.
    ///
    /// Skipping the truncate would leave phantom entries for the next
    /// open; skipping the file sync would lose durability.
    ///
    /// # Errors
    /// Returns an error if any of the sync/truncate steps fail.
    pub fn close(self) -> LogResult<()> {
        let Self {
            file, mmap, size, ..
        } = self;

        mmap.flush().map_err(|e| LogError::io("index mmap sync", e))?;
        drop(mmap); // unmap before truncating under the map

        file.sync_all().map_err(|e| LogError::io("index sync", e))?;
        file.set_len(size)
            .map_err(|e| LogError::io("index truncate", e))?;
        Ok(())
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("path", &self.path)
            .field("entries", &self.entries())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_INDEX_BYTES: u64 = 1024;

    #[test]
    fn test_empty_index_reads_eof() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path().join("empty.index"), MAX_INDEX_BYTES).unwrap();

        assert!(matches!(index.read(-1), Err(LogError::Eof)));
        assert_eq!(index.entries(), 0);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = Index::open(dir.path().join("rw.index"), MAX_INDEX_BYTES).unwrap();

        let entries = [(0u32, 0u64), (1, 19), (2, 38)];
        for (rel, pos) in entries {
            index.write(rel, pos).unwrap();
        }

        for (i, (rel, pos)) in entries.iter().enumerate() {
            assert_eq!(index.read(i as i64).unwrap(), (*rel, *pos));
        }

        // -1 selects the last entry.
        assert_eq!(index.read(-1).unwrap(), (2, 38));

        // Reading past the last entry is EOF.
        assert!(matches!(index.read(3), Err(LogError::Eof)));
    }

    #[test]
    fn test_write_fails_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut index =
            Index::open(dir.path().join("full.index"), ENTRY_WIDTH * 2).unwrap();

        index.write(0, 0).unwrap();
        index.write(1, 10).unwrap();
        assert!(index.is_maxed());
        assert!(matches!(index.write(2, 20), Err(LogError::Eof)));
    }

    #[test]
    fn test_close_truncates_and_reopen_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.index");

        {
            let mut index = Index::open(&path, MAX_INDEX_BYTES).unwrap();
            index.write(0, 0).unwrap();
            index.write(1, 27).unwrap();
            index.close().unwrap();
        }

        // The file is truncated to exactly the logical size.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * ENTRY_WIDTH);

        let index = Index::open(&path, MAX_INDEX_BYTES).unwrap();
        assert_eq!(index.entries(), 2);
        assert_eq!(index.read(-1).unwrap(), (1, 27));
    }
}
