use std::fmt;

use crate::entry::Entry;
use crate::message::Message;
use crate::types::EntryId;
use crate::types::LogMark;

/// A contiguous block of log entries anchored at the entry preceding it.
///
/// `term` is the term of the leader that produced the block, and bounds
/// every entry term in it: `prev.term <= entries[..].term <= term`. A
/// receiver that accepts the slice knows its log through
/// [`last_index`](Self::last_index) is a prefix of that leader's log.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
pub(crate) struct LogSlice {
    /// The term of the leader whose log this slice was taken from.
    pub(crate) term: u64,
    /// The id of the entry immediately preceding `entries`.
    pub(crate) prev: EntryId,
    pub(crate) entries: Vec<Entry>,
}

/// Why a slice failed validation.
#[derive(Clone, Debug)]
#[derive(PartialEq, Eq)]
pub(crate) struct InvalidSlice(String);

impl fmt::Display for InvalidSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log slice: {}", self.0)
    }
}

impl LogSlice {
    pub(crate) fn new(term: u64, prev: EntryId, entries: Vec<Entry>) -> Self {
        Self { term, prev, entries }
    }

    /// Reconstructs the slice carried by an `App` message.
    pub(crate) fn from_append(m: &Message) -> Self {
        Self {
            term: m.term,
            prev: EntryId::new(m.log_term, m.index),
            entries: m.entries.clone(),
        }
    }

    /// Checks the internal consistency of the slice: indices are
    /// consecutive from `prev`, terms are monotone and bounded by the
    /// leader term.
    pub(crate) fn valid(&self) -> Result<(), InvalidSlice> {
        let mut prev = self.prev;
        for e in &self.entries {
            if e.index != prev.index + 1 {
                return Err(InvalidSlice(format!(
                    "entry index {} does not follow {}",
                    e.index, prev.index
                )));
            }
            if e.term < prev.term {
                return Err(InvalidSlice(format!(
                    "entry term regressed from {} to {} at index {}",
                    prev.term, e.term, e.index
                )));
            }
            prev = e.id();
        }
        if self.term < prev.term {
            return Err(InvalidSlice(format!(
                "leader term {} is below entry term {}",
                self.term, prev.term
            )));
        }
        Ok(())
    }

    pub(crate) fn last_index(&self) -> u64 {
        self.entries.last().map_or(self.prev.index, |e| e.index)
    }

    /// The end of this slice, stamped with the leader term under which
    /// it was accepted.
    pub(crate) fn mark(&self) -> LogMark {
        LogMark::new(self.term, self.last_index())
    }

    /// Skips entries at or below `index`, moving the anchor forward.
    /// `index` must lie within `[prev.index, last_index()]`.
    pub(crate) fn forward(mut self, index: u64) -> Self {
        debug_assert!(index >= self.prev.index && index <= self.last_index());
        if index == self.prev.index {
            return self;
        }
        let skip = (index - self.prev.index) as usize;
        self.prev = self.entries[skip - 1].id();
        self.entries.drain(..skip);
        self
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entry::EntryPayload;

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

    #[test]
    fn test_valid() {
        slice(5, (1, 3), &[(2, 4), (2, 5), (5, 6)]).valid().unwrap();
        slice(5, (5, 3), &[]).valid().unwrap();

        // Index gap.
        assert!(slice(5, (1, 3), &[(2, 5)]).valid().is_err());
        // Term regression.
        assert!(slice(5, (3, 3), &[(2, 4)]).valid().is_err());
        // Entry term above the leader term.
        assert!(slice(4, (1, 3), &[(5, 4)]).valid().is_err());
    }

    #[test]
    fn test_accessors() {
        let s = slice(5, (1, 3), &[(2, 4), (5, 5)]);
        assert_eq!(5, s.last_index());
        assert_eq!(LogMark::new(5, 5), s.mark());

        let empty = slice(5, (3, 7), &[]);
        assert_eq!(7, empty.last_index());
        assert_eq!(LogMark::new(5, 7), empty.mark());
    }

    #[test]
    fn test_forward() {
        let s = slice(5, (1, 3), &[(2, 4), (2, 5), (5, 6)]);

        let fwd = s.clone().forward(5);
        assert_eq!(EntryId::new(2, 5), fwd.prev);
        assert_eq!(vec![entry(5, 6)], fwd.entries);

        let all = s.clone().forward(6);
        assert_eq!(EntryId::new(5, 6), all.prev);
        assert!(all.entries.is_empty());

        let none = s.forward(3);
        assert_eq!(EntryId::new(1, 3), none.prev);
        assert_eq!(3, none.entries.len());
    }
}
