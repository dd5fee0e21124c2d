use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;

use crate::quorum::VoteResult;
use crate::types::PeerId;

/// A single set of voters deciding by simple majority.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
pub struct MajorityConfig(pub(crate) BTreeSet<PeerId>);

impl MajorityConfig {
    pub fn new(voters: BTreeSet<PeerId>) -> Self {
        Self(voters)
    }

    /// The largest index acknowledged by a majority, where `acked`
    /// reports the per-voter acknowledged index (`None` for unknown).
    ///
    /// An empty configuration returns `u64::MAX`: combined with another
    /// set via `min`, the empty half then never constrains the result.
    pub fn committed_index<F>(&self, acked: F) -> u64
    where F: Fn(PeerId) -> Option<u64> {
        let n = self.0.len();
        if n == 0 {
            return u64::MAX;
        }
        let mut srt: Vec<u64> = self.0.iter().map(|&id| acked(id).unwrap_or(0)).collect();
        srt.sort_unstable();
        // The (n/2 + 1)-th largest value is acknowledged by a majority.
        srt[n - (n / 2 + 1)]
    }

    /// Tallies the recorded votes. Missing voters count as pending.
    ///
    /// An empty configuration wins trivially, so the empty half of a
    /// non-joint [`JointConfig`](crate::quorum::JointConfig) never blocks
    /// a decision.
    pub fn vote_result(&self, votes: &BTreeMap<PeerId, bool>) -> VoteResult {
        if self.0.is_empty() {
            return VoteResult::Won;
        }
        let mut granted = 0;
        let mut missing = 0;
        for id in &self.0 {
            match votes.get(id) {
                None => missing += 1,
                Some(true) => granted += 1,
                Some(false) => {}
            }
        }
        let quorum = self.0.len() / 2 + 1;
        if granted >= quorum {
            VoteResult::Won
        } else if granted + missing >= quorum {
            VoteResult::Pending
        } else {
            VoteResult::Lost
        }
    }
}

impl Deref for MajorityConfig {
    type Target = BTreeSet<PeerId>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for MajorityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    use super::*;

    fn acked(pairs: &[(PeerId, u64)]) -> impl Fn(PeerId) -> Option<u64> + '_ {
        move |id| pairs.iter().find(|(p, _)| *p == id).map(|(_, idx)| *idx)
    }

    #[test]
    fn test_committed_index_majority() {
        let c = MajorityConfig::new(btreeset! {1, 2, 3});
        assert_eq!(0, c.committed_index(acked(&[])));
        assert_eq!(0, c.committed_index(acked(&[(1, 5)])));
        assert_eq!(5, c.committed_index(acked(&[(1, 5), (2, 7)])));
        assert_eq!(7, c.committed_index(acked(&[(1, 5), (2, 7), (3, 9)])));
    }

    #[test]
    fn test_committed_index_even_sized() {
        let c = MajorityConfig::new(btreeset! {1, 2, 3, 4});
        // Three of four must acknowledge.
        assert_eq!(5, c.committed_index(acked(&[(1, 5), (2, 7), (3, 9)])));
        assert_eq!(0, c.committed_index(acked(&[(1, 5), (2, 7)])));
    }

    #[test]
    fn test_committed_index_empty_config_is_unbounded() {
        let c = MajorityConfig::default();
        assert_eq!(u64::MAX, c.committed_index(acked(&[])));
    }

    #[test]
    fn test_vote_result() {
        let c = MajorityConfig::new(btreeset! {1, 2, 3});

        let mut votes = BTreeMap::new();
        assert_eq!(VoteResult::Pending, c.vote_result(&votes));

        votes.insert(1, true);
        assert_eq!(VoteResult::Pending, c.vote_result(&votes));

        votes.insert(2, false);
        assert_eq!(VoteResult::Pending, c.vote_result(&votes));

        votes.insert(3, true);
        assert_eq!(VoteResult::Won, c.vote_result(&votes));

        let lost: BTreeMap<_, _> = [(1, false), (2, false)].into_iter().collect();
        assert_eq!(VoteResult::Lost, c.vote_result(&lost));
    }

    #[test]
    fn test_vote_result_empty_config_wins() {
        let c = MajorityConfig::default();
        assert_eq!(VoteResult::Won, c.vote_result(&BTreeMap::new()));
    }
}
