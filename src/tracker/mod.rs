//! Per-peer replication state, as maintained by the leader.

mod inflights;
mod progress;
mod votes;

use std::collections::BTreeMap;

pub(crate) use inflights::Inflights;
pub use progress::Progress;
pub use progress::ProgressState;
pub(crate) use votes::VoteTracker;

use crate::quorum::QuorumConfig;
use crate::quorum::VoteResult;
use crate::types::PeerId;

/// Replication state per peer, keyed by id. Includes the local replica.
pub(crate) type ProgressMap = BTreeMap<PeerId, Progress>;

/// Tracks the active configuration and the progress of every peer in it.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
pub struct ProgressTracker {
    pub(crate) config: QuorumConfig,
    pub(crate) progress: ProgressMap,
}

impl ProgressTracker {
    pub(crate) fn new(config: QuorumConfig, progress: ProgressMap) -> Self {
        Self { config, progress }
    }

    pub fn progress(&self, id: PeerId) -> Option<&Progress> {
        self.progress.get(&id)
    }

    pub(crate) fn progress_mut(&mut self, id: PeerId) -> Option<&mut Progress> {
        self.progress.get_mut(&id)
    }

    /// Applies `f` to every tracked peer, in id order.
    pub(crate) fn visit<F>(&mut self, mut f: F)
    where F: FnMut(PeerId, &mut Progress) {
        for (id, pr) in self.progress.iter_mut() {
            f(*id, pr);
        }
    }

    /// The largest index replicated to a quorum of the (possibly joint)
    /// voter configuration.
    pub(crate) fn committed(&self) -> u64 {
        self.config
            .voters
            .committed_index(|id| self.progress.get(&id).map(|pr| pr.matched))
    }

    /// True iff a quorum of voters has been active since the last
    /// CheckQuorum cycle.
    pub(crate) fn quorum_active(&self) -> bool {
        let res = self
            .config
            .voters
            .vote_result(&self.progress.iter().map(|(id, pr)| (*id, pr.recent_active)).collect());
        res == VoteResult::Won
    }

    pub(crate) fn voter_ids(&self) -> std::collections::BTreeSet<PeerId> {
        self.config.voters.ids()
    }

    /// Moves the progress map out, leaving the tracker empty. Used when
    /// rebuilding the tracker for a new configuration.
    pub(crate) fn take_progress(&mut self) -> ProgressMap {
        std::mem::take(&mut self.progress)
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::quorum::JointConfig;

    fn tracker(voters: &[PeerId], matched: &[u64]) -> ProgressTracker {
        let config = QuorumConfig {
            voters: JointConfig::new(voters.iter().copied().collect()),
            ..Default::default()
        };
        let mut progress = ProgressMap::new();
        for (id, m) in voters.iter().zip(matched) {
            let mut pr = Progress::new(m + 1, 256, u64::MAX);
            pr.matched = *m;
            progress.insert(*id, pr);
        }
        ProgressTracker::new(config, progress)
    }

    #[test]
    fn test_committed() {
        let t = tracker(&[1, 2, 3], &[10, 5, 7]);
        assert_eq!(7, t.committed());
    }

    #[test]
    fn test_quorum_active() {
        let mut t = tracker(&[1, 2, 3], &[0, 0, 0]);
        t.progress_mut(1).unwrap().recent_active = true;
        assert!(!t.quorum_active());

        t.progress_mut(3).unwrap().recent_active = true;
        assert!(t.quorum_active());
    }

    #[test]
    fn test_visit_in_id_order() {
        let mut t = tracker(&[3, 1, 2], &[0, 0, 0]);
        let mut seen = vec![];
        t.visit(|id, _| seen.push(id));
        assert_eq!(vec![1, 2, 3], seen);
    }

    #[test]
    fn test_voter_ids() {
        let t = tracker(&[1, 2], &[0, 0]);
        assert_eq!(btreeset! {1, 2}, t.voter_ids());
    }
}
