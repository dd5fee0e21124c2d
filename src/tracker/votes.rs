use std::collections::BTreeMap;

use crate::quorum::JointConfig;
use crate::quorum::VoteResult;
use crate::types::PeerId;

/// Records the grants and rejections of one (pre-)election.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
pub(crate) struct VoteTracker {
    votes: BTreeMap<PeerId, bool>,
}

impl VoteTracker {
    /// Records that `id` voted. Only the first vote of a peer counts;
    /// duplicates are ignored.
    pub(crate) fn record_vote(&mut self, id: PeerId, granted: bool) {
        self.votes.entry(id).or_insert(granted);
    }

    /// Tallies the recorded votes against `voters` and also returns the
    /// raw grant/reject counts (for logging).
    pub(crate) fn tally_votes(&self, voters: &JointConfig) -> (usize, usize, VoteResult) {
        // Counted over the voters only; stale votes from removed peers
        // are recorded but do not affect the outcome.
        let mut granted = 0;
        let mut rejected = 0;
        for (id, v) in &self.votes {
            if !voters.contains(*id) {
                continue;
            }
            if *v {
                granted += 1;
            } else {
                rejected += 1;
            }
        }
        (granted, rejected, voters.vote_result(&self.votes))
    }

    pub(crate) fn reset_votes(&mut self) {
        self.votes.clear();
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_tally() {
        let voters = JointConfig::new(btreeset! {1, 2, 3});
        let mut t = VoteTracker::default();

        assert_eq!((0, 0, VoteResult::Pending), t.tally_votes(&voters));

        t.record_vote(1, true);
        assert_eq!((1, 0, VoteResult::Pending), t.tally_votes(&voters));

        t.record_vote(2, true);
        assert_eq!((2, 0, VoteResult::Won), t.tally_votes(&voters));
    }

    #[test]
    fn test_first_vote_wins() {
        let voters = JointConfig::new(btreeset! {1});
        let mut t = VoteTracker::default();

        t.record_vote(1, false);
        t.record_vote(1, true);
        assert_eq!((0, 1, VoteResult::Lost), t.tally_votes(&voters));
    }

    #[test]
    fn test_lost_election() {
        let voters = JointConfig::new(btreeset! {1, 2, 3});
        let mut t = VoteTracker::default();

        t.record_vote(1, true);
        t.record_vote(2, false);
        t.record_vote(3, false);
        assert_eq!((1, 2, VoteResult::Lost), t.tally_votes(&voters));
    }
}
