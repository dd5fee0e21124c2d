use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use crate::quorum::MajorityConfig;
use crate::quorum::VoteResult;
use crate::types::PeerId;

/// A pair of majority configurations deciding jointly.
///
/// Outside a membership change the outgoing half is empty and the
/// incoming half decides alone. During a joint configuration both halves
/// must independently reach quorum.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
pub struct JointConfig {
    pub(crate) incoming: MajorityConfig,
    pub(crate) outgoing: MajorityConfig,
}

impl JointConfig {
    pub fn new(incoming: BTreeSet<PeerId>) -> Self {
        Self {
            incoming: MajorityConfig::new(incoming),
            outgoing: MajorityConfig::default(),
        }
    }

    pub fn incoming(&self) -> &MajorityConfig {
        &self.incoming
    }

    pub fn outgoing(&self) -> &MajorityConfig {
        &self.outgoing
    }

    /// All voter ids across both halves.
    pub fn ids(&self) -> BTreeSet<PeerId> {
        self.incoming.union(&self.outgoing.0).copied().collect()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.incoming.contains(&id) || self.outgoing.contains(&id)
    }

    /// The largest index acknowledged by a quorum in both halves.
    pub fn committed_index<F>(&self, acked: F) -> u64
    where F: Fn(PeerId) -> Option<u64> {
        let inc = self.incoming.committed_index(&acked);
        let out = self.outgoing.committed_index(&acked);
        inc.min(out)
    }

    /// Tallies a vote that must be won in both halves.
    pub fn vote_result(&self, votes: &BTreeMap<PeerId, bool>) -> VoteResult {
        let inc = self.incoming.vote_result(votes);
        let out = self.outgoing.vote_result(votes);
        match (inc, out) {
            (VoteResult::Lost, _) | (_, VoteResult::Lost) => VoteResult::Lost,
            (VoteResult::Won, VoteResult::Won) => VoteResult::Won,
            _ => VoteResult::Pending,
        }
    }
}

impl fmt::Display for JointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.outgoing.is_empty() {
            write!(f, "{}", self.incoming)
        } else {
            write!(f, "{}&&{}", self.incoming, self.outgoing)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::BTreeSet;

    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    use super::*;

    fn acked(pairs: &[(PeerId, u64)]) -> impl Fn(PeerId) -> Option<u64> + '_ {
        move |id| pairs.iter().find(|(p, _)| *p == id).map(|(_, idx)| *idx)
    }

    fn joint(incoming: BTreeSet<PeerId>, outgoing: BTreeSet<PeerId>) -> JointConfig {
        JointConfig {
            incoming: MajorityConfig::new(incoming),
            outgoing: MajorityConfig::new(outgoing),
        }
    }

    #[test]
    fn test_committed_index_requires_both_halves() {
        let c = joint(btreeset! {1, 2, 4, 5}, btreeset! {1, 2, 3});
        // Quorum in the outgoing half only.
        assert_eq!(0, c.committed_index(acked(&[(1, 9), (2, 9)])));
        // Quorum in both.
        assert_eq!(7, c.committed_index(acked(&[(1, 9), (2, 9), (4, 7), (5, 5)])));
    }

    #[test]
    fn test_committed_index_non_joint() {
        let c = JointConfig::new(btreeset! {1, 2, 3});
        assert_eq!(5, c.committed_index(acked(&[(1, 5), (2, 7)])));
    }

    #[test]
    fn test_vote_result_joint() {
        let c = joint(btreeset! {1, 2, 3}, btreeset! {3, 4, 5});

        let votes: BTreeMap<_, _> = [(1, true), (2, true)].into_iter().collect();
        // Incoming won, outgoing pending.
        assert_eq!(VoteResult::Pending, c.vote_result(&votes));

        let votes: BTreeMap<_, _> =
            [(1, true), (2, true), (3, true)].into_iter().collect();
        assert_eq!(VoteResult::Won, c.vote_result(&votes));

        let votes: BTreeMap<_, _> =
            [(1, true), (2, true), (4, false), (5, false)].into_iter().collect();
        // Outgoing can no longer reach quorum.
        assert_eq!(VoteResult::Lost, c.vote_result(&votes));
    }

    #[test]
    fn test_ids_union() {
        let c = joint(btreeset! {1, 2}, btreeset! {2, 3});
        assert_eq!(btreeset! {1, 2, 3}, c.ids());
    }
}
