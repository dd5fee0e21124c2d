use crate::entry::Entry;
use crate::log_slice::LogSlice;
use crate::state::Snapshot;
use crate::types::EntryId;
use crate::types::LogMark;

/// The in-memory tail of the log: entries (and possibly a snapshot) that
/// have been accepted but not yet durably persisted by the host.
///
/// Layout: `snapshot` (optional) immediately precedes `prev`, and
/// `entries` start at `prev.index + 1`. When a snapshot is present and no
/// entries follow it, `prev` equals the snapshot's last entry id.
///
/// `term` is the *accepted term*: the term of the leader whose appends
/// produced the current suffix. It gates commit-index advancement — see
/// [`LogMark`].
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
pub(crate) struct Unstable {
    pub(crate) snapshot: Option<Snapshot>,
    /// The accepted term.
    pub(crate) term: u64,
    /// The id of the entry preceding `entries`: the last stable entry,
    /// or the snapshot's last entry.
    pub(crate) prev: EntryId,
    pub(crate) entries: Vec<Entry>,

    /// True once the snapshot has been handed to the host for
    /// persistence.
    snapshot_in_progress: bool,
    /// The highest entry index already handed to the host. Entries in
    /// `(in_progress, last_index]` are pending hand-out.
    in_progress: u64,
}

impl Unstable {
    /// An unstable tail positioned after the last stable entry.
    pub(crate) fn new(last: EntryId) -> Self {
        Self {
            snapshot: None,
            term: last.term,
            prev: last,
            entries: Vec::new(),
            snapshot_in_progress: false,
            in_progress: last.index,
        }
    }

    pub(crate) fn last_index(&self) -> u64 {
        self.entries.last().map_or(self.prev.index, |e| e.index)
    }

    pub(crate) fn last_entry_id(&self) -> EntryId {
        self.entries.last().map_or(self.prev, |e| e.id())
    }

    /// The first index covered by this unstable tail, if it holds a
    /// snapshot. Entries below it are shadowed in stable storage.
    pub(crate) fn maybe_first_index(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|s| s.meta.index + 1)
    }

    /// The term of the entry at `index`, if this tail covers it.
    pub(crate) fn maybe_term(&self, index: u64) -> Option<u64> {
        if index == self.prev.index {
            return Some(self.prev.term);
        }
        if index > self.prev.index && index <= self.last_index() {
            let e = &self.entries[(index - self.prev.index - 1) as usize];
            return Some(e.term);
        }
        None
    }

    /// Bumps the accepted term without appending: the log up to its
    /// current end is known to be a prefix of the `term` leader's log.
    pub(crate) fn accept_term(&mut self, term: u64) {
        debug_assert!(term >= self.term, "accepted term regressed: {} < {}", term, self.term);
        self.term = term;
    }

    /// Replaces the suffix of the log starting at `slice.prev.index + 1`
    /// with the slice's entries. `slice.prev.index` must not precede the
    /// unstable anchor unless the whole suffix (and a piece of the stable
    /// log) is being rewritten.
    pub(crate) fn truncate_and_append(&mut self, slice: LogSlice) {
        self.accept_term(slice.term);
        let after = slice.prev.index;
        if after < self.prev.index {
            // The rewrite reaches below this tail: stable entries above
            // `after` are shadowed and the suffix is replaced wholesale.
            self.prev = slice.prev;
            self.entries = slice.entries;
            self.in_progress = self.in_progress.min(after);
        } else if after == self.prev.index + self.entries.len() as u64 {
            // Directly after the current suffix.
            self.entries.extend(slice.entries);
        } else {
            // Truncate the conflicting tail, then append.
            self.entries.truncate((after - self.prev.index) as usize);
            self.entries.extend(slice.entries);
            self.in_progress = self.in_progress.min(after);
        }
    }

    /// Moves the stable boundary forward after the host persisted
    /// entries up to `mark`. A mark from a superseded leader term is
    /// ignored: the entries it refers to have been overwritten.
    pub(crate) fn stable_to(&mut self, mark: LogMark) {
        if mark.term != self.term {
            tracing::debug!(
                "ignoring stale stable mark {} at accepted term {}",
                mark,
                self.term
            );
            return;
        }
        if mark.index <= self.prev.index {
            return;
        }
        assert!(
            mark.index <= self.last_index(),
            "stable mark {} is beyond last index {}",
            mark,
            self.last_index()
        );
        let n = (mark.index - self.prev.index) as usize;
        self.prev = self.entries[n - 1].id();
        self.entries.drain(..n);
        // The host may persist entries it was stepped with directly,
        // ahead of the ready hand-out cursor.
        self.in_progress = self.in_progress.max(mark.index);
    }

    /// Drops the snapshot once the host reports it persisted and
    /// applied.
    pub(crate) fn stable_snap_to(&mut self, index: u64) {
        if let Some(s) = &self.snapshot {
            if s.meta.index == index {
                self.snapshot = None;
                self.snapshot_in_progress = false;
            }
        }
    }

    /// Replaces the whole log view with a snapshot received from the
    /// `term` leader.
    pub(crate) fn restore(&mut self, term: u64, snapshot: Snapshot) {
        let id = EntryId::new(snapshot.meta.term, snapshot.meta.index);
        self.term = term;
        self.prev = id;
        self.entries.clear();
        self.in_progress = id.index;
        self.snapshot = Some(snapshot);
        self.snapshot_in_progress = false;
    }

    /// Entries not yet handed to the host for persistence.
    pub(crate) fn next_entries(&self) -> &[Entry] {
        let offset = (self.in_progress.max(self.prev.index) - self.prev.index) as usize;
        &self.entries[offset..]
    }

    pub(crate) fn has_next_entries(&self) -> bool {
        self.in_progress.max(self.prev.index) < self.last_index()
    }

    pub(crate) fn next_snapshot(&self) -> Option<&Snapshot> {
        if self.snapshot_in_progress {
            None
        } else {
            self.snapshot.as_ref()
        }
    }

    pub(crate) fn has_in_progress_snapshot(&self) -> bool {
        self.snapshot_in_progress && self.snapshot.is_some()
    }

    /// Marks everything currently pending as handed out.
    pub(crate) fn accept_in_progress(&mut self) {
        if self.snapshot.is_some() {
            self.snapshot_in_progress = true;
        }
        self.in_progress = self.last_index();
    }

    /// The mark identifying the current unstable end, used to
    /// acknowledge persistence.
    pub(crate) fn mark(&self) -> LogMark {
        LogMark::new(self.term, self.last_index())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entry::EntryPayload;
    use crate::state::SnapshotMeta;

    fn entry(term: u64, index: u64) -> Entry {
        Entry::new(term, index, EntryPayload::default())
    }

    fn slice(term: u64, prev: (u64, u64), ids: &[(u64, u64)]) -> LogSlice {
        LogSlice::new(
            term,
            EntryId::new(prev.0, prev.1),
            ids.iter().map(|&(t, i)| entry(t, i)).collect(),
        )
    }

    fn unstable_with(prev: (u64, u64), ids: &[(u64, u64)]) -> Unstable {
        let mut u = Unstable::new(EntryId::new(prev.0, prev.1));
        if let Some(&(t, _)) = ids.last() {
            u.truncate_and_append(slice(t, prev, ids));
        }
        u
    }

    #[test]
    fn test_maybe_term() {
        let u = unstable_with((1, 4), &[(2, 5), (3, 6)]);
        assert_eq!(Some(1), u.maybe_term(4));
        assert_eq!(Some(2), u.maybe_term(5));
        assert_eq!(Some(3), u.maybe_term(6));
        assert_eq!(None, u.maybe_term(3));
        assert_eq!(None, u.maybe_term(7));
    }

    #[test]
    fn test_truncate_and_append() {
        let mut u = unstable_with((1, 4), &[(2, 5), (2, 6)]);

        // Append directly after.
        u.truncate_and_append(slice(2, (2, 6), &[(2, 7)]));
        assert_eq!(7, u.last_index());

        // Truncating rewrite in the middle.
        u.truncate_and_append(slice(3, (2, 5), &[(3, 6)]));
        assert_eq!(6, u.last_index());
        assert_eq!(Some(3), u.maybe_term(6));
        assert_eq!(3, u.term);

        // Rewrite below the anchor.
        u.truncate_and_append(slice(4, (1, 3), &[(4, 4)]));
        assert_eq!(EntryId::new(1, 3), u.prev);
        assert_eq!(4, u.last_index());
    }

    #[test]
    fn test_stable_to() {
        let mut u = unstable_with((1, 4), &[(2, 5), (2, 6)]);
        u.stable_to(LogMark::new(2, 5));
        assert_eq!(EntryId::new(2, 5), u.prev);
        assert_eq!(1, u.entries.len());

        // A stale mark from an older accepted term is ignored.
        u.truncate_and_append(slice(3, (2, 5), &[(3, 6)]));
        u.stable_to(LogMark::new(2, 6));
        assert_eq!(EntryId::new(2, 5), u.prev);
        assert_eq!(1, u.entries.len());

        u.stable_to(LogMark::new(3, 6));
        assert_eq!(EntryId::new(3, 6), u.prev);
        assert!(u.entries.is_empty());
    }

    #[test]
    fn test_restore_and_stable_snap_to() {
        let mut u = unstable_with((1, 4), &[(2, 5)]);
        let snap = Snapshot {
            meta: SnapshotMeta {
                index: 10,
                term: 3,
                ..Default::default()
            },
            data: vec![],
        };
        u.restore(4, snap);
        assert_eq!(EntryId::new(3, 10), u.prev);
        assert_eq!(10, u.last_index());
        assert_eq!(4, u.term);
        assert_eq!(Some(11), u.maybe_first_index());
        assert!(u.next_snapshot().is_some());

        u.accept_in_progress();
        assert!(u.next_snapshot().is_none());
        assert!(u.has_in_progress_snapshot());

        u.stable_snap_to(10);
        assert!(u.snapshot.is_none());
        assert!(!u.has_in_progress_snapshot());
    }

    #[test]
    fn test_next_entries_hand_out() {
        let mut u = unstable_with((1, 4), &[(2, 5), (2, 6)]);
        assert!(u.has_next_entries());
        assert_eq!(2, u.next_entries().len());

        u.accept_in_progress();
        assert!(!u.has_next_entries());
        assert!(u.next_entries().is_empty());

        // A truncating rewrite re-exposes the overwritten indexes.
        u.truncate_and_append(slice(3, (2, 5), &[(3, 6)]));
        assert!(u.has_next_entries());
        assert_eq!(1, u.next_entries().len());
    }
}
