use std::collections::BTreeSet;
use std::fmt;

use crate::types::PeerId;
use crate::types::StateRole;

/// The state a replica must persist durably before releasing any message
/// that is predicated on it.
#[derive(Clone, Copy, Debug, Default)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct HardState {
    /// The current term.
    pub term: u64,
    /// The candidate this replica voted for in `term`, or `NONE`.
    pub vote: PeerId,
    /// The highest committed log index.
    pub commit: u64,
    /// The leader this replica supports in `term`, or `NONE`.
    pub lead: PeerId,
    /// The epoch under which `lead` holds its lease in the liveness
    /// fabric. Opaque to the core: loaded, persisted and cleared when the
    /// term moves, never minted here.
    pub lead_epoch: u64,
}

impl HardState {
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }
}

impl fmt::Display for HardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "term:{} vote:{} commit:{} lead:{} epoch:{}",
            self.term, self.vote, self.commit, self.lead, self.lead_epoch
        )
    }
}

/// Volatile state useful to hosts (current role and known leader). Not
/// persisted.
#[derive(Clone, Copy, Debug, Default)]
#[derive(PartialEq, Eq)]
pub struct SoftState {
    pub lead: PeerId,
    pub state: StateRole,
}

/// The membership of the group as recorded in the log or a snapshot.
///
/// The configuration is joint iff `voters_outgoing` is non-empty.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ConfState {
    /// The incoming voter set.
    pub voters: Vec<PeerId>,
    pub learners: Vec<PeerId>,
    /// The outgoing voter set of a joint configuration.
    pub voters_outgoing: Vec<PeerId>,
    /// Peers that become learners when the joint configuration is left.
    /// A peer appears here iff it is in `voters_outgoing` and cannot be
    /// a learner while still a voter of the outgoing set.
    pub learners_next: Vec<PeerId>,
    pub auto_leave: bool,
}

impl ConfState {
    /// Order-insensitive equivalence.
    pub fn equivalent(&self, other: &ConfState) -> bool {
        fn set(ids: &[PeerId]) -> BTreeSet<PeerId> {
            ids.iter().copied().collect()
        }
        set(&self.voters) == set(&other.voters)
            && set(&self.learners) == set(&other.learners)
            && set(&self.voters_outgoing) == set(&other.voters_outgoing)
            && set(&self.learners_next) == set(&other.learners_next)
            && self.auto_leave == other.auto_leave
    }

    /// Returns true if `id` appears in any voter or learner set.
    pub(crate) fn contains(&self, id: PeerId) -> bool {
        // learners_next need not be checked: a peer there is always in
        // voters_outgoing.
        self.voters.contains(&id)
            || self.learners.contains(&id)
            || self.voters_outgoing.contains(&id)
    }
}

/// Metadata describing what a snapshot covers.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SnapshotMeta {
    /// The last log index included in the snapshot.
    pub index: u64,
    /// The term of the entry at `index`.
    pub term: u64,
    /// The membership as of `index`.
    pub conf_state: ConfState,
}

/// A point-in-time state machine image, logically equivalent to the log
/// prefix through `meta.index`.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    /// Opaque state machine payload.
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.meta.index == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_state_equivalence() {
        let a = ConfState {
            voters: vec![1, 2, 3],
            ..Default::default()
        };
        let b = ConfState {
            voters: vec![3, 1, 2],
            ..Default::default()
        };
        assert!(a.equivalent(&b));

        let c = ConfState {
            voters: vec![1, 2],
            ..Default::default()
        };
        assert!(!a.equivalent(&c));
    }

    #[test]
    fn test_conf_state_contains() {
        let cs = ConfState {
            voters: vec![1, 2],
            learners: vec![3],
            voters_outgoing: vec![4],
            ..Default::default()
        };
        assert!(cs.contains(1));
        assert!(cs.contains(3));
        assert!(cs.contains(4));
        assert!(!cs.contains(5));
    }
}
