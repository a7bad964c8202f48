use crate::types::{Entry, LogIndex, Term};

/// The in-memory view of the replicated log: a compacted prefix, summarized
/// by the index and term of its last entry, followed by the retained suffix.
///
/// Entries in the suffix are contiguous and start at `snapshot_index + 1`.
#[derive(Debug, Clone)]
pub struct RaftLog<C> {
    entries: Vec<Entry<C>>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
}

impl<C> Default for RaftLog<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            snapshot_index: 0,
            snapshot_term: 0,
        }
    }
}

impl<C: Clone> RaftLog<C> {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from recovered state. Entries covered by the snapshot
    /// are dropped, and the suffix stops at the first gap.
    pub fn restore(snapshot_index: LogIndex, snapshot_term: Term, entries: Vec<Entry<C>>) -> Self {
        let mut log = Self {
            entries: Vec::with_capacity(entries.len()),
            snapshot_index,
            snapshot_term,
        };
        for entry in entries {
            if entry.index <= snapshot_index {
                continue;
            }
            if entry.index != log.last_index() + 1 {
                tracing::warn!(
                    index = entry.index,
                    expected = log.last_index() + 1,
                    "gap in recovered log; ignoring the remainder"
                );
                break;
            }
            log.entries.push(entry);
        }
        log
    }

    /// Index of the last compacted entry.
    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    /// Term of the last compacted entry.
    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    /// First index still held in memory.
    pub fn first_index(&self) -> LogIndex {
        self.snapshot_index + 1
    }

    /// Index of the last entry, or of the snapshot if the suffix is empty.
    pub fn last_index(&self) -> LogIndex {
        self.snapshot_index + self.entries.len() as u64
    }

    /// Term of the last entry.
    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        if index <= self.snapshot_index || index > self.last_index() {
            None
        } else {
            Some((index - self.snapshot_index - 1) as usize)
        }
    }

    /// Term of the entry at `index`, if it is known.
    ///
    /// Index zero has term zero, and the snapshot boundary reports the
    /// snapshot term. Compacted and missing entries have no known term.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.position(index).map(|pos| self.entries[pos].term)
    }

    /// Whether the log holds an entry at `index` with `term`.
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Entry at `index`, if held in memory.
    pub fn get(&self, index: LogIndex) -> Option<&Entry<C>> {
        self.position(index).map(|pos| &self.entries[pos])
    }

    /// Up to `max` entries starting at `from`, stopping at `to` inclusive.
    pub fn slice(&self, from: LogIndex, to: LogIndex, max: usize) -> Vec<Entry<C>> {
        let Some(start) = self.position(from.max(self.first_index())) else {
            return Vec::new();
        };
        let end = to.min(self.last_index());
        if end < from {
            return Vec::new();
        }
        let count = ((end - from.max(self.first_index()) + 1) as usize).min(max);
        self.entries[start..start + count].to_vec()
    }

    /// Entries in `(from, to]`.
    pub fn entries_after(&self, from: LogIndex, to: LogIndex) -> impl Iterator<Item = &Entry<C>> {
        self.entries
            .iter()
            .skip_while(move |e| e.index <= from)
            .take_while(move |e| e.index <= to)
    }

    /// Append an entry which must directly follow the current last index.
    pub fn append(&mut self, entry: Entry<C>) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "non-contiguous append");
        self.entries.push(entry);
    }

    /// Drop every entry at or after `index`.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if let Some(pos) = self.position(index) {
            self.entries.truncate(pos);
        }
    }

    /// Drop entries up to and including `index`, which becomes the new
    /// snapshot boundary. Entries after it are kept.
    pub fn compact_to(&mut self, index: LogIndex, term: Term) {
        if index <= self.snapshot_index {
            return;
        }
        let drop = ((index - self.snapshot_index) as usize).min(self.entries.len());
        self.entries.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Replace the whole log with a snapshot boundary.
    pub fn reset_to(&mut self, index: LogIndex, term: Term) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Whether a log ending at (`last_term`, `last_index`) is at least as
    /// up to date as this one.
    pub fn is_up_to_date(&self, last_term: Term, last_index: LogIndex) -> bool {
        (last_term, last_index) >= (self.last_term(), self.last_index())
    }

    /// First index of the run of entries sharing the term found at `index`,
    /// never going below `floor`. Used to skip a whole conflicting term at once.
    pub fn first_index_of_term_at(&self, index: LogIndex, floor: LogIndex) -> LogIndex {
        let Some(term) = self.term_at(index) else {
            return index;
        };
        let mut first = index;
        while first > floor.max(self.first_index()) && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryPayload;

    fn entry(index: LogIndex, term: Term) -> Entry<u32> {
        Entry::new(index, term, EntryPayload::Blank)
    }

    fn log(terms: &[Term]) -> RaftLog<u32> {
        let mut log = RaftLog::new();
        for (i, term) in terms.iter().enumerate() {
            log.append(entry(i as u64 + 1, *term));
        }
        log
    }

    #[test]
    fn empty_log() {
        let log: RaftLog<u32> = RaftLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert!(log.matches(0, 0));
        assert!(!log.matches(1, 1));
    }

    #[test]
    fn truncate_drops_suffix() {
        let mut log = log(&[1, 1, 2, 2]);
        log.truncate_from(3);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
        log.truncate_from(10);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn compaction_keeps_boundary_term() {
        let mut log = log(&[1, 1, 2, 3]);
        log.compact_to(2, 1);
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(1), None);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.slice(1, 4, 10).len(), 2);
        assert_eq!(log.slice(3, 4, 1)[0].index, 3);
    }

    #[test]
    fn restore_skips_covered_entries_and_stops_at_gap() {
        let entries = vec![entry(3, 1), entry(4, 1), entry(5, 2), entry(7, 2)];
        let log = RaftLog::restore(3, 1, entries);
        assert_eq!(log.first_index(), 4);
        assert_eq!(log.last_index(), 5);
    }

    #[test]
    fn up_to_date_compares_term_then_index() {
        let log = log(&[1, 2, 2]);
        assert!(log.is_up_to_date(2, 3));
        assert!(log.is_up_to_date(3, 1));
        assert!(!log.is_up_to_date(2, 2));
        assert!(!log.is_up_to_date(1, 10));
    }

    #[test]
    fn conflict_hint_skips_whole_term() {
        let log = log(&[1, 2, 2, 2, 3]);
        assert_eq!(log.first_index_of_term_at(4, 0), 2);
        assert_eq!(log.first_index_of_term_at(4, 3), 3);
        assert_eq!(log.first_index_of_term_at(5, 0), 5);
    }
}
