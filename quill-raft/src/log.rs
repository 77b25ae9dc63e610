//! The in-memory raft log window.
//!
//! [`RaftLog`] holds the suffix of the log that has not been compacted
//! into a snapshot. Indexes are 1-based; index 0 means "before the log".
//! The runtime loads the window from its `LogStore` at startup and mirrors
//! every mutation the node emits back to disk.

use quill_core::{LogIndex, Term};

use crate::entry::Entry;

/// The in-memory window of raft log entries.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    /// Entries after the compaction point; `entries[0].index` is
    /// `snapshot_last_index + 1`.
    entries: Vec<Entry>,
    /// Index of the last entry folded into a snapshot (0 = none).
    snapshot_last_index: LogIndex,
    /// Term of that entry.
    snapshot_last_term: Term,
}

impl RaftLog {
    /// An empty log with no snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the window from recovered state.
    ///
    /// # Panics
    /// Panics if the entries do not start right after the snapshot point
    /// or are not contiguous.
    #[must_use]
    pub fn recovered(
        snapshot_last_index: LogIndex,
        snapshot_last_term: Term,
        entries: Vec<Entry>,
    ) -> Self {
        if let Some(first) = entries.first() {
            assert_eq!(
                first.index,
                snapshot_last_index.next(),
                "log window must start right after the snapshot"
            );
        }
        for pair in entries.windows(2) {
            assert_eq!(pair[1].index, pair[0].index.next(), "entries must be contiguous");
        }
        Self {
            entries,
            snapshot_last_index,
            snapshot_last_term,
        }
    }

    /// The index of the last entry (compacted or present).
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map_or(self.snapshot_last_index, |e| e.index)
    }

    /// The term of the last entry (compacted or present).
    #[must_use]
    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map_or(self.snapshot_last_term, |e| e.term)
    }

    /// The index of the last snapshot-compacted entry (0 = none).
    #[must_use]
    pub const fn snapshot_last_index(&self) -> LogIndex {
        self.snapshot_last_index
    }

    /// The term of the last snapshot-compacted entry.
    #[must_use]
    pub const fn snapshot_last_term(&self) -> Term {
        self.snapshot_last_term
    }

    /// Number of entries in the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the window holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The term at `index`, when this log can know it.
    ///
    /// Index 0 is "before the log" and has term 0; the compaction point's
    /// term is remembered; anything older is unknown.
    #[must_use]
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index.get() == 0 {
            return Some(Term::new(0));
        }
        if index == self.snapshot_last_index {
            return Some(self.snapshot_last_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// The entry at `index`, if it is inside the window.
    #[must_use]
    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        if index <= self.snapshot_last_index {
            return None;
        }
        let slot = usize::try_from(index.get() - self.snapshot_last_index.get() - 1)
            .expect("log window fits in memory");
        self.entries.get(slot)
    }

    /// Appends one entry.
    ///
    /// # Panics
    /// Panics if the entry's index is not the next index.
    pub fn append(&mut self, entry: Entry) {
        assert_eq!(
            entry.index,
            self.last_index().next(),
            "entry index must be sequential"
        );
        self.entries.push(entry);
    }

    /// Clones entries from `from` (inclusive) to the end, capped at
    /// `max` entries.
    #[must_use]
    pub fn entries_from(&self, from: LogIndex, max: usize) -> Vec<Entry> {
        if from <= self.snapshot_last_index {
            return Vec::new();
        }
        let start = usize::try_from(from.get() - self.snapshot_last_index.get() - 1)
            .expect("log window fits in memory");
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// Drops every entry with index >= `from` (conflict resolution).
    pub fn truncate_from(&mut self, from: LogIndex) {
        if from <= self.snapshot_last_index {
            self.entries.clear();
            return;
        }
        let keep = usize::try_from(from.get() - self.snapshot_last_index.get() - 1)
            .expect("log window fits in memory");
        self.entries.truncate(keep);
    }

    /// Drops every entry at or below `through` after it was folded into a
    /// snapshot.
    pub fn compact_through(&mut self, through: LogIndex, term: Term) {
        if through <= self.snapshot_last_index {
            return;
        }
        let drop = usize::try_from(through.get() - self.snapshot_last_index.get())
            .expect("log window fits in memory");
        if drop >= self.entries.len() {
            self.entries.clear();
        } else {
            self.entries.drain(..drop);
        }
        self.snapshot_last_index = through;
        self.snapshot_last_term = term;
    }

    /// Replaces the whole window after a snapshot install.
    pub fn install_snapshot(&mut self, last_index: LogIndex, last_term: Term) {
        self.entries.clear();
        self.snapshot_last_index = last_index;
        self.snapshot_last_term = last_term;
    }

    /// True if a candidate with `(last_term, last_index)` is at least as
    /// up-to-date as this log.
    #[must_use]
    pub fn is_up_to_date(&self, last_term: Term, last_index: LogIndex) -> bool {
        (last_term, last_index) >= (self.last_term(), self.last_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;
    use bytes::Bytes;

    fn entry(term: u64, index: u64) -> Entry {
        Entry::new(
            Term::new(term),
            LogIndex::new(index),
            EntryKind::Command,
            Bytes::from(format!("e-{index}")),
        )
    }

    #[test]
    fn test_append_and_get() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));

        assert_eq!(log.last_index(), LogIndex::new(2));
        assert_eq!(log.last_term(), Term::new(1));
        assert_eq!(log.get(LogIndex::new(1)).unwrap().index, LogIndex::new(1));
        assert!(log.get(LogIndex::new(3)).is_none());
    }

    #[test]
    fn test_term_at_sentinel_values() {
        let log = RaftLog::new();
        assert_eq!(log.term_at(LogIndex::new(0)), Some(Term::new(0)));
        assert_eq!(log.term_at(LogIndex::new(1)), None);
    }

    #[test]
    fn test_truncate_from() {
        let mut log = RaftLog::new();
        for i in 1..=5 {
            log.append(entry(1, i));
        }
        log.truncate_from(LogIndex::new(3));
        assert_eq!(log.last_index(), LogIndex::new(2));
        assert!(log.get(LogIndex::new(3)).is_none());
    }

    #[test]
    fn test_compact_through_remembers_term() {
        let mut log = RaftLog::new();
        for i in 1..=4 {
            log.append(entry(2, i));
        }
        log.compact_through(LogIndex::new(3), Term::new(2));

        assert_eq!(log.snapshot_last_index(), LogIndex::new(3));
        assert_eq!(log.term_at(LogIndex::new(3)), Some(Term::new(2)));
        assert!(log.get(LogIndex::new(3)).is_none());
        assert_eq!(log.get(LogIndex::new(4)).unwrap().index, LogIndex::new(4));
        assert_eq!(log.last_index(), LogIndex::new(4));

        // Appending continues from the window's end.
        log.append(entry(2, 5));
        assert_eq!(log.last_index(), LogIndex::new(5));
    }

    #[test]
    fn test_up_to_date_comparison() {
        let mut log = RaftLog::new();
        log.append(entry(2, 1));

        // Higher term wins regardless of index.
        assert!(log.is_up_to_date(Term::new(3), LogIndex::new(0)));
        // Same term needs at least the same index.
        assert!(log.is_up_to_date(Term::new(2), LogIndex::new(1)));
        assert!(!log.is_up_to_date(Term::new(2), LogIndex::new(0)));
        assert!(!log.is_up_to_date(Term::new(1), LogIndex::new(5)));
    }

    #[test]
    fn test_recovered_window() {
        let log = RaftLog::recovered(
            LogIndex::new(2),
            Term::new(1),
            vec![entry(2, 3), entry(2, 4)],
        );
        assert_eq!(log.last_index(), LogIndex::new(4));
        assert_eq!(log.term_at(LogIndex::new(2)), Some(Term::new(1)));
    }
}
