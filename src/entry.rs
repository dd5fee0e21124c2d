use std::fmt;

use crate::confchange::ConfChange;
use crate::confchange::ConfChangeV2;
use crate::types::EntryId;

/// The kind of a log entry, as visible on the wire.
#[derive(Clone, Copy, Debug, Default)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum EntryType {
    #[default]
    Normal,
    ConfChange,
    ConfChangeV2,
}

/// The payload of a log entry.
///
/// Application data is opaque to the core. Configuration changes are
/// typed so that the core can validate and apply them without a
/// serialization round-trip.
#[derive(Clone, Debug)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum EntryPayload {
    /// Opaque application data. An empty vector is the blank entry a new
    /// leader appends at the start of its term.
    Normal(Vec<u8>),
    /// A legacy single-step configuration change.
    ConfChange(ConfChange),
    /// A (possibly joint) configuration change.
    ConfChangeV2(ConfChangeV2),
}

impl Default for EntryPayload {
    fn default() -> Self {
        EntryPayload::Normal(Vec::new())
    }
}

impl EntryPayload {
    pub fn entry_type(&self) -> EntryType {
        match self {
            EntryPayload::Normal(_) => EntryType::Normal,
            EntryPayload::ConfChange(_) => EntryType::ConfChange,
            EntryPayload::ConfChangeV2(_) => EntryType::ConfChangeV2,
        }
    }

    /// The byte size counted against the uncommitted-tail quota.
    ///
    /// An empty normal entry and an empty `ConfChangeV2` (the auto-leave
    /// proposal) both register as zero, so they can never be refused by
    /// the quota.
    pub(crate) fn size(&self) -> u64 {
        match self {
            EntryPayload::Normal(data) => data.len() as u64,
            EntryPayload::ConfChange(cc) => 9 + cc.context.len() as u64,
            EntryPayload::ConfChangeV2(cc) => {
                9 * cc.changes.len() as u64 + cc.context.len() as u64
            }
        }
    }

    pub fn is_conf_change(&self) -> bool {
        !matches!(self, EntryPayload::Normal(_))
    }
}

/// A single entry of the replicated log.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub payload: EntryPayload,
}

impl Entry {
    pub fn new(term: u64, index: u64, payload: EntryPayload) -> Self {
        Self { term, index, payload }
    }

    pub fn id(&self) -> EntryId {
        EntryId::new(self.term, self.index)
    }

    /// The payload bytes of this entry.
    pub fn payload_size(&self) -> u64 {
        self.payload.size()
    }

    /// An estimate of the encoded size of this entry, used for message
    /// and apply batching limits.
    pub fn encoded_size(&self) -> u64 {
        self.payload.size() + ENTRY_OVERHEAD
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {:?}", self.term, self.index, self.payload.entry_type())
    }
}

/// Fixed per-entry overhead (index, term, type) counted by
/// [`Entry::encoded_size`].
const ENTRY_OVERHEAD: u64 = 12;

/// Sum of payload bytes across entries.
pub(crate) fn payloads_size(entries: &[Entry]) -> u64 {
    entries.iter().map(|e| e.payload_size()).sum()
}

/// Sum of estimated encoded bytes across entries.
pub(crate) fn ents_size(entries: &[Entry]) -> u64 {
    entries.iter().map(|e| e.encoded_size()).sum()
}

/// Truncates `entries` so that the total encoded size does not exceed
/// `max_size`, but always retains at least the first entry.
pub(crate) fn limit_size(entries: &mut Vec<Entry>, max_size: u64) {
    if entries.len() <= 1 {
        return;
    }
    let mut size = 0;
    let mut keep = 0;
    for e in entries.iter() {
        size += e.encoded_size();
        if keep > 0 && size > max_size {
            break;
        }
        keep += 1;
    }
    entries.truncate(keep);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal(index: u64, len: usize) -> Entry {
        Entry::new(1, index, EntryPayload::Normal(vec![0; len]))
    }

    #[test]
    fn test_payload_sizes() {
        assert_eq!(0, Entry::new(1, 1, EntryPayload::default()).payload_size());
        assert_eq!(7, normal(1, 7).payload_size());
        assert_eq!(0, EntryPayload::ConfChangeV2(ConfChangeV2::default()).size());
    }

    #[test]
    fn test_limit_size_keeps_first_entry() {
        let mut ents = vec![normal(1, 100), normal(2, 100)];
        limit_size(&mut ents, 1);
        assert_eq!(1, ents.len());
        assert_eq!(1, ents[0].index);
    }

    #[test]
    fn test_limit_size_bounds_total() {
        let mut ents = vec![normal(1, 100), normal(2, 100), normal(3, 100)];
        let two = ents[0].encoded_size() + ents[1].encoded_size();
        limit_size(&mut ents, two);
        assert_eq!(2, ents.len());

        let mut all = vec![normal(1, 100), normal(2, 100), normal(3, 100)];
        limit_size(&mut all, u64::MAX);
        assert_eq!(3, all.len());
    }
}
