use crate::entry::ents_size;
use crate::entry::limit_size;
use crate::entry::Entry;
use crate::error::StorageError;
use crate::log_slice::LogSlice;
use crate::log_unstable::Unstable;
use crate::state::Snapshot;
use crate::storage::Storage;
use crate::types::EntryId;
use crate::types::LogMark;

/// The unified log view: the stable prefix read from [`Storage`], the
/// unstable suffix held in memory, and the commit/apply cursors.
///
/// Invariants:
/// `snapshot index <= stable index <= last index`,
/// `committed <= last index`, `applied <= applying <= committed`.
#[derive(Debug)]
pub struct RaftLog<S: Storage> {
    pub(crate) storage: S,
    pub(crate) unstable: Unstable,

    /// The highest index known to be committed on a quorum.
    pub(crate) committed: u64,
    /// The highest index handed out for application.
    pub(crate) applying: u64,
    /// The highest index applied to the state machine.
    pub(crate) applied: u64,

    /// Byte budget for outstanding (handed out, unacknowledged) apply
    /// batches.
    max_applying_size: u64,
    /// Bytes of outstanding apply batches.
    applying_size: u64,
    /// Set when the next apply batch could not fit the budget at all;
    /// cleared as acknowledgments release budget.
    applying_paused: bool,
}

impl<S: Storage> RaftLog<S> {
    /// Builds the view over `storage`, positioning the unstable suffix
    /// after the last persisted entry.
    ///
    /// Panics on storage errors: the replica cannot start from a log it
    /// cannot read.
    pub(crate) fn new(storage: S, max_applying_size: u64) -> Self {
        let first_index = storage.first_index().expect("storage first index");
        let last_index = storage.last_index().expect("storage last index");
        let last_term = storage.term(last_index).expect("storage last term");
        let committed = first_index - 1;
        Self {
            storage,
            unstable: Unstable::new(EntryId::new(last_term, last_index)),
            committed,
            applying: committed,
            applied: committed,
            max_applying_size,
            applying_size: 0,
            applying_paused: false,
        }
    }

    pub(crate) fn first_index(&self) -> u64 {
        self.unstable
            .maybe_first_index()
            .unwrap_or_else(|| self.storage.first_index().expect("storage first index"))
    }

    pub(crate) fn last_index(&self) -> u64 {
        self.unstable.last_index()
    }

    pub(crate) fn last_entry_id(&self) -> EntryId {
        self.unstable.last_entry_id()
    }

    /// The accepted term: the term of the leader whose appends produced
    /// the current unstable suffix.
    pub(crate) fn acc_term(&self) -> u64 {
        self.unstable.term
    }

    /// The term of the entry at `index`.
    pub(crate) fn term(&self, index: u64) -> Result<u64, StorageError> {
        if let Some(t) = self.unstable.maybe_term(index) {
            return Ok(t);
        }
        if index + 1 < self.first_index() {
            return Err(StorageError::Compacted);
        }
        if index > self.last_index() {
            return Err(StorageError::Unavailable);
        }
        self.storage.term(index)
    }

    pub(crate) fn zero_term_on_out_of_bounds(&self, index: u64) -> u64 {
        self.term(index).unwrap_or(0)
    }

    pub(crate) fn match_term(&self, id: EntryId) -> bool {
        self.term(id.index).map(|t| t == id.term).unwrap_or(false)
    }

    /// The up-to-date rule for vote granting: the candidate's last entry
    /// must not be behind ours.
    pub(crate) fn is_up_to_date(&self, cand_last: EntryId) -> bool {
        let last = self.last_entry_id();
        cand_last.term > last.term
            || (cand_last.term == last.term && cand_last.index >= last.index)
    }

    /// Leader-side append of entries it stamped itself. Returns false if
    /// the slice does not connect to the current end of the log.
    pub(crate) fn append(&mut self, slice: LogSlice) -> bool {
        if slice.prev != self.last_entry_id() || slice.term < self.acc_term() {
            return false;
        }
        if let Some(first) = slice.entries.first() {
            if first.index <= self.committed {
                return false;
            }
        }
        self.unstable.truncate_and_append(slice);
        true
    }

    /// Follower-side append: truncates a conflicting suffix at the first
    /// term mismatch, appends the non-duplicate tail and adopts the
    /// leader's term as the accepted term. Idempotent. Returns false iff
    /// the slice's anchor is not in the log.
    pub(crate) fn maybe_append(&mut self, slice: LogSlice) -> bool {
        let Some(matched) = self.match_slice(&slice) else {
            return false;
        };
        let novel = slice.forward(matched);
        if let Some(first) = novel.entries.first() {
            assert!(
                first.index > self.committed,
                "entry {} conflicts with committed entry [committed {}]",
                first.index,
                self.committed
            );
            self.unstable.truncate_and_append(novel);
        } else {
            // Nothing new, but the log through the slice end is now known
            // to be a prefix of this leader's log.
            self.unstable.accept_term(novel.term);
        }
        true
    }

    /// The largest index within the slice's range at which our log
    /// agrees with it, or `None` if the anchor itself does not match.
    fn match_slice(&self, slice: &LogSlice) -> Option<u64> {
        if !self.match_term(slice.prev) {
            return None;
        }
        let mut matched = slice.prev.index;
        for e in &slice.entries {
            if !self.match_term(e.id()) {
                break;
            }
            matched = e.index;
        }
        Some(matched)
    }

    /// Raises the commit index to `mark.index`, but only under a mark
    /// whose term equals the accepted term: only then is our log through
    /// that index known to be a prefix of the marking leader's log.
    /// Never regresses.
    pub(crate) fn commit_to(&mut self, mark: LogMark) {
        if mark.term != self.acc_term() {
            return;
        }
        if self.committed >= mark.index {
            return;
        }
        assert!(
            mark.index <= self.last_index(),
            "tocommit({}) is out of range [last index {}]. Was the raft log corrupted, truncated, or lost?",
            mark.index,
            self.last_index()
        );
        self.committed = mark.index;
    }

    /// Finds the largest index `<= index` whose stored term is
    /// `<= term`, for skipping over runs of mismatched entries in one
    /// round trip. Returns the index and its term (zero if unknown).
    pub(crate) fn find_conflict_by_term(&self, index: u64, term: u64) -> (u64, u64) {
        let mut index = index;
        while index > 0 {
            match self.term(index) {
                // An unreadable slot (compacted, or past our end) might
                // match; report it with an unknown term.
                Err(_) => return (index, 0),
                Ok(our_term) if our_term <= term => return (index, our_term),
                Ok(_) => index -= 1,
            }
        }
        (0, 0)
    }

    /// Entries starting at `lo` through the end of the log, limited to
    /// `max_size` encoded bytes but never empty.
    pub(crate) fn entries(&self, lo: u64, max_size: u64) -> Result<Vec<Entry>, StorageError> {
        let last = self.last_index();
        if lo > last {
            return Ok(Vec::new());
        }
        self.slice(lo, last + 1, max_size)
    }

    /// Entries in `[lo, hi)` limited to `max_size` encoded bytes, always
    /// including at least one entry.
    pub(crate) fn slice(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>, StorageError> {
        self.must_check_out_of_bounds(lo, hi)?;
        if lo == hi {
            return Ok(Vec::new());
        }
        let unstable_lo = self.unstable.prev.index + 1;
        let mut ents: Vec<Entry>;
        if lo >= unstable_lo {
            ents = self.unstable.entries
                [(lo - unstable_lo) as usize..(hi - unstable_lo) as usize]
                .to_vec();
            limit_size(&mut ents, max_size);
        } else {
            let stable_hi = hi.min(unstable_lo);
            ents = self.storage.entries(lo, stable_hi, max_size)?;
            // Only bridge into the unstable suffix if the stable read was
            // not truncated by the size limit.
            if stable_hi < hi && ents.len() as u64 == stable_hi - lo {
                let tail = &self.unstable.entries[..(hi - unstable_lo) as usize];
                ents.extend_from_slice(tail);
                limit_size(&mut ents, max_size);
            }
        }
        Ok(ents)
    }

    fn must_check_out_of_bounds(&self, lo: u64, hi: u64) -> Result<(), StorageError> {
        assert!(lo <= hi, "invalid slice {} > {}", lo, hi);
        if lo < self.first_index() {
            return Err(StorageError::Compacted);
        }
        if hi > self.last_index() + 1 {
            panic!(
                "slice[{},{}) out of bound [{},{}]",
                lo,
                hi,
                self.first_index(),
                self.last_index()
            );
        }
        Ok(())
    }

    /// Visits entries in `[lo, hi)` in pages of at most `page_size`
    /// encoded bytes. The visitor may stop the scan early by returning
    /// false.
    pub(crate) fn scan<F>(&self, lo: u64, hi: u64, page_size: u64, mut visit: F) -> Result<(), StorageError>
    where F: FnMut(&[Entry]) -> bool {
        let mut lo = lo;
        while lo < hi {
            let ents = self.slice(lo, hi, page_size)?;
            assert!(!ents.is_empty(), "scan made no progress at index {}", lo);
            lo += ents.len() as u64;
            if !visit(&ents) {
                return Ok(());
            }
        }
        Ok(())
    }

    // --- apply flow ---

    /// Committed entries not yet handed out for application, within the
    /// applying byte budget. With `allow_unstable`, entries not yet
    /// durable may be applied (only safe when the state machine itself
    /// is not persisted ahead of the log).
    pub(crate) fn next_committed_ents(&self, allow_unstable: bool) -> Vec<Entry> {
        if self.applying_paused || self.has_next_or_in_progress_snapshot() {
            return Vec::new();
        }
        let (lo, hi) = (self.applying + 1, self.max_appliable_index(allow_unstable) + 1);
        if lo >= hi {
            return Vec::new();
        }
        let max_size = self.max_applying_size.saturating_sub(self.applying_size);
        if max_size == 0 {
            return Vec::new();
        }
        match self.slice(lo, hi, max_size) {
            Ok(ents) => ents,
            Err(err) => panic!("unexpected error fetching unapplied entries: {}", err),
        }
    }

    pub(crate) fn has_next_committed_ents(&self, allow_unstable: bool) -> bool {
        let applying = self.max_appliable_index(allow_unstable);
        self.applying < applying
            && !self.applying_paused
            && !self.has_next_or_in_progress_snapshot()
    }

    pub(crate) fn max_applying_size(&self) -> u64 {
        self.max_applying_size
    }

    fn max_appliable_index(&self, allow_unstable: bool) -> u64 {
        if allow_unstable {
            self.committed
        } else {
            self.committed.min(self.unstable.prev.index)
        }
    }

    /// Accounts for entries up to `index` (totalling `size` bytes)
    /// having been handed out for application.
    pub(crate) fn accept_applying(&mut self, index: u64, size: u64, allow_unstable: bool) {
        assert!(index <= self.max_appliable_index(allow_unstable));
        self.applying = self.applying.max(index);
        self.applying_size = self.applying_size.saturating_add(size);
        if self.applying_size >= self.max_applying_size {
            self.applying_paused = true;
        }
    }

    /// Advances the applied cursor and releases `size` bytes of the
    /// applying budget.
    pub(crate) fn applied_to(&mut self, index: u64, size: u64) {
        assert!(
            index >= self.applied && index <= self.committed,
            "applied({}) is out of range [prev applied {}, committed {}]",
            index,
            self.applied,
            self.committed
        );
        self.applied = index;
        self.applying = self.applying.max(index);
        self.applying_size = self.applying_size.saturating_sub(size);
        if self.applying_size == 0 {
            // The budget may pause applies only while acknowledgments
            // are outstanding.
            self.applying_paused = false;
        }
    }

    // --- stability ---

    pub(crate) fn stable_to(&mut self, mark: LogMark) {
        self.unstable.stable_to(mark);
    }

    pub(crate) fn stable_snap_to(&mut self, index: u64) {
        self.unstable.stable_snap_to(index);
    }

    pub(crate) fn has_next_unstable_ents(&self) -> bool {
        self.unstable.has_next_entries()
    }

    pub(crate) fn next_unstable_ents(&self) -> &[Entry] {
        self.unstable.next_entries()
    }

    pub(crate) fn next_unstable_snapshot(&self) -> Option<&Snapshot> {
        self.unstable.next_snapshot()
    }

    pub(crate) fn has_next_or_in_progress_snapshot(&self) -> bool {
        self.unstable.next_snapshot().is_some() || self.unstable.has_in_progress_snapshot()
    }

    pub(crate) fn accept_unstable(&mut self) {
        self.unstable.accept_in_progress();
    }

    /// The most recent snapshot: a pending unstable one, or whatever
    /// storage has.
    pub(crate) fn snapshot(&self) -> Result<Snapshot, StorageError> {
        if let Some(s) = &self.unstable.snapshot {
            return Ok(s.clone());
        }
        self.storage.snapshot()
    }

    /// Replaces the log with a snapshot received from the `term` leader.
    pub(crate) fn restore(&mut self, term: u64, snapshot: Snapshot) {
        let index = snapshot.meta.index;
        assert!(index > self.committed, "restoring a snapshot at or below committed");
        self.unstable.restore(term, snapshot);
        self.committed = index;
        // The apply cursors stay put: the state machine catches up when
        // the snapshot itself is applied.
        self.applying = self.applying.max(self.applied);
    }
}
