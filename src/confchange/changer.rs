use crate::confchange::ConfChangeSingle;
use crate::confchange::ConfChangeType;
use crate::error::Error;
use crate::quorum::MajorityConfig;
use crate::quorum::QuorumConfig;
use crate::state::ConfState;
use crate::tracker::Progress;
use crate::tracker::ProgressMap;
use crate::types::PeerId;
use crate::types::NONE;

/// Applies configuration changes to a `(QuorumConfig, ProgressMap)`
/// pair, producing the successor pair without touching the originals
/// until the change is validated.
pub(crate) struct Changer {
    pub(crate) config: QuorumConfig,
    pub(crate) progress: ProgressMap,
    pub(crate) max_inflight_msgs: u64,
    pub(crate) max_inflight_bytes: u64,
    /// The current last log index; newly added peers are probed from
    /// here.
    pub(crate) last_index: u64,
}

type ChangeResult = Result<(QuorumConfig, ProgressMap), Error>;

fn err(msg: impl Into<String>) -> Error {
    Error::ConfChange(msg.into())
}

impl Changer {
    /// Applies a change that touches at most one voter directly, without
    /// going through a joint configuration.
    pub(crate) fn simple(mut self, changes: &[ConfChangeSingle]) -> ChangeResult {
        if self.config.is_joint() {
            return Err(err("can't apply simple config change in joint config"));
        }
        let before: std::collections::BTreeSet<PeerId> =
            self.config.voters.incoming().0.clone();
        self.apply(changes)?;
        let after = &self.config.voters.incoming().0;
        if before.symmetric_difference(after).count() > 1 {
            return Err(err("more than one voter changed without entering joint config"));
        }
        self.check_and_return()
    }

    /// Enters a joint configuration: the current incoming voters become
    /// the outgoing set, and `changes` shape the new incoming set.
    pub(crate) fn enter_joint(mut self, auto_leave: bool, changes: &[ConfChangeSingle]) -> ChangeResult {
        if self.config.is_joint() {
            return Err(err("config is already joint"));
        }
        if self.config.voters.incoming().is_empty() {
            // Adding nodes to an empty config is allowed (bootstrap),
            // but a joint transition out of nothing is not.
            return Err(err("can't make a zero-voter config joint"));
        }
        self.config.voters.outgoing = MajorityConfig::new(self.config.voters.incoming().0.clone());
        self.apply(changes)?;
        self.config.auto_leave = auto_leave;
        self.check_and_return()
    }

    /// Leaves the joint configuration: staged learners are materialized
    /// and outgoing-only voters are dropped.
    pub(crate) fn leave_joint(mut self) -> ChangeResult {
        if !self.config.is_joint() {
            return Err(err("can't leave a non-joint config"));
        }
        for id in std::mem::take(&mut self.config.learners_next) {
            self.config.learners.insert(id);
            if let Some(pr) = self.progress.get_mut(&id) {
                pr.is_learner = true;
            }
        }
        let outgoing: Vec<PeerId> = self.config.voters.outgoing().iter().copied().collect();
        for id in outgoing {
            let is_voter = self.config.voters.incoming().contains(&id);
            let is_learner = self.config.learners.contains(&id);
            if !is_voter && !is_learner {
                self.progress.remove(&id);
            }
        }
        self.config.voters.outgoing = MajorityConfig::default();
        self.config.auto_leave = false;
        self.check_and_return()
    }

    /// Rebuilds configuration and progress from a persisted `ConfState`,
    /// as found in a snapshot or at startup. `changer` must start from
    /// the empty configuration.
    pub(crate) fn restore(self, cs: &ConfState) -> ChangeResult {
        let (outgoing, incoming) = to_conf_change_singles(cs);
        let (max_msgs, max_bytes, last_index) =
            (self.max_inflight_msgs, self.max_inflight_bytes, self.last_index);
        let rebuild = |(config, progress)| Changer {
            config,
            progress,
            max_inflight_msgs: max_msgs,
            max_inflight_bytes: max_bytes,
            last_index,
        };
        let mut chg = self;
        if outgoing.is_empty() {
            // No joint state: apply the incoming changes one by one.
            for cc in &incoming {
                chg = rebuild(chg.simple(std::slice::from_ref(cc))?);
            }
        } else {
            // Re-create the outgoing config first, then enter the joint
            // state with the incoming changes applied on top.
            for cc in &outgoing {
                chg = rebuild(chg.simple(std::slice::from_ref(cc))?);
            }
            chg = rebuild(chg.enter_joint(cs.auto_leave, &incoming)?);
        }
        Ok((chg.config, chg.progress))
    }

    fn apply(&mut self, changes: &[ConfChangeSingle]) -> Result<(), Error> {
        for cc in changes {
            if cc.node_id == NONE {
                // Replaces an invalidated change (e.g. a no-op slot);
                // skip.
                continue;
            }
            match cc.change_type {
                ConfChangeType::AddNode => self.make_voter(cc.node_id),
                ConfChangeType::AddLearnerNode => self.make_learner(cc.node_id),
                ConfChangeType::RemoveNode => self.remove(cc.node_id),
                ConfChangeType::UpdateNode => {}
            }
        }
        if self.config.voters.incoming().is_empty() {
            return Err(err("removed all voters"));
        }
        Ok(())
    }

    fn make_voter(&mut self, id: PeerId) {
        match self.progress.get_mut(&id) {
            None => self.init_progress(id, false),
            Some(pr) => {
                pr.is_learner = false;
                self.config.learners.remove(&id);
                self.config.learners_next.remove(&id);
                self.config.voters.incoming.0.insert(id);
            }
        }
    }

    fn make_learner(&mut self, id: PeerId) {
        let Some(pr) = self.progress.get(&id) else {
            self.init_progress(id, true);
            return;
        };
        if pr.is_learner {
            return;
        }
        // Remove the voter, but keep its progress around.
        let keep = self.progress.get(&id).cloned();
        self.remove(id);
        if let Some(pr) = keep {
            self.progress.entry(id).or_insert(pr);
        }
        if self.config.voters.outgoing().contains(&id) {
            // Still a voter of the outgoing half; it becomes a learner
            // only on leaving the joint config.
            self.config.learners_next.insert(id);
        } else {
            if let Some(pr) = self.progress.get_mut(&id) {
                pr.is_learner = true;
            }
            self.config.learners.insert(id);
        }
    }

    fn remove(&mut self, id: PeerId) {
        if !self.progress.contains_key(&id) {
            return;
        }
        self.config.voters.incoming.0.remove(&id);
        self.config.learners.remove(&id);
        self.config.learners_next.remove(&id);
        // Keep the progress while the peer is still a voter of the
        // outgoing half.
        if !self.config.voters.outgoing().contains(&id) {
            self.progress.remove(&id);
        }
    }

    fn init_progress(&mut self, id: PeerId, is_learner: bool) {
        if is_learner {
            self.config.learners.insert(id);
        } else {
            self.config.voters.incoming.0.insert(id);
        }
        let mut pr = Progress::new(
            self.last_index + 1,
            self.max_inflight_msgs,
            self.max_inflight_bytes,
        );
        pr.is_learner = is_learner;
        // A freshly added peer starts out active; it has no history of
        // being unresponsive to hold against it.
        pr.recent_active = true;
        self.progress.insert(id, pr);
    }

    fn check_and_return(self) -> ChangeResult {
        check_invariants(&self.config, &self.progress)?;
        Ok((self.config, self.progress))
    }
}

fn check_invariants(config: &QuorumConfig, progress: &ProgressMap) -> Result<(), Error> {
    for id in config
        .voters
        .ids()
        .iter()
        .chain(config.learners.iter())
        .chain(config.learners_next.iter())
    {
        if !progress.contains_key(id) {
            return Err(err(format!("no progress for {}", id)));
        }
    }
    for id in &config.learners_next {
        if !config.voters.outgoing().contains(id) {
            return Err(err(format!("{} is in learners_next, but not in the outgoing voters", id)));
        }
        if progress[id].is_learner {
            return Err(err(format!("{} is in learners_next, but already marked as learner", id)));
        }
    }
    for id in &config.learners {
        if config.voters.contains(*id) {
            return Err(err(format!("{} is in learners and voters", id)));
        }
        if !progress[id].is_learner {
            return Err(err(format!("{} is in learners, but not marked as learner", id)));
        }
    }
    if !config.is_joint() {
        if !config.learners_next.is_empty() {
            return Err(err("learners_next must be empty when not joint"));
        }
        if config.auto_leave {
            return Err(err("auto_leave must be false when not joint"));
        }
    }
    Ok(())
}

/// Decomposes a `ConfState` into the changes that reconstruct it: first
/// the pre-joint (outgoing) voters, then the changes that lead into the
/// (possibly joint) target state.
fn to_conf_change_singles(cs: &ConfState) -> (Vec<ConfChangeSingle>, Vec<ConfChangeSingle>) {
    let mut outgoing = Vec::new();
    let mut incoming = Vec::new();
    for &id in &cs.voters_outgoing {
        outgoing.push(ConfChangeSingle::new(ConfChangeType::AddNode, id));
    }
    // On top of the outgoing config: drop its voters, then build the
    // target sets.
    for &id in &cs.voters_outgoing {
        incoming.push(ConfChangeSingle::new(ConfChangeType::RemoveNode, id));
    }
    for &id in &cs.voters {
        incoming.push(ConfChangeSingle::new(ConfChangeType::AddNode, id));
    }
    for &id in &cs.learners {
        incoming.push(ConfChangeSingle::new(ConfChangeType::AddLearnerNode, id));
    }
    for &id in &cs.learners_next {
        incoming.push(ConfChangeSingle::new(ConfChangeType::AddLearnerNode, id));
    }
    (outgoing, incoming)
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    use super::*;

    fn changer(config: QuorumConfig, progress: ProgressMap) -> Changer {
        Changer {
            config,
            progress,
            max_inflight_msgs: 256,
            max_inflight_bytes: u64::MAX,
            last_index: 10,
        }
    }

    fn empty_changer() -> Changer {
        changer(QuorumConfig::default(), ProgressMap::new())
    }

    fn add(id: PeerId) -> ConfChangeSingle {
        ConfChangeSingle::new(ConfChangeType::AddNode, id)
    }

    fn add_learner(id: PeerId) -> ConfChangeSingle {
        ConfChangeSingle::new(ConfChangeType::AddLearnerNode, id)
    }

    fn remove(id: PeerId) -> ConfChangeSingle {
        ConfChangeSingle::new(ConfChangeType::RemoveNode, id)
    }

    fn restore_from(cs: &ConfState) -> (QuorumConfig, ProgressMap) {
        empty_changer().restore(cs).unwrap()
    }

    #[test]
    fn test_simple_bootstrap_one_by_one() {
        let (config, progress) = empty_changer().simple(&[add(1)]).unwrap();
        let (config, progress) = changer(config, progress).simple(&[add(2)]).unwrap();
        assert_eq!(btreeset! {1, 2}, config.voters.ids());
        assert_eq!(11, progress[&1].next);
        assert!(progress[&1].recent_active);
    }

    #[test]
    fn test_simple_rejects_multi_voter_change() {
        let (config, progress) = empty_changer().simple(&[add(1)]).unwrap();
        assert!(changer(config, progress).simple(&[add(2), add(3)]).is_err());
    }

    #[test]
    fn test_simple_rejects_removing_last_voter() {
        let (config, progress) = empty_changer().simple(&[add(1)]).unwrap();
        assert!(changer(config, progress).simple(&[remove(1)]).is_err());
    }

    #[test]
    fn test_enter_and_leave_joint() {
        let cs = ConfState {
            voters: vec![1, 2, 3],
            ..Default::default()
        };
        let (config, progress) = restore_from(&cs);

        // 1,2,3 -> 1,2,4,5 via joint consensus.
        let (config, progress) = changer(config, progress)
            .enter_joint(true, &[remove(3), add(4), add(5)])
            .unwrap();
        assert!(config.is_joint());
        assert!(config.auto_leave);
        assert_eq!(btreeset! {1, 2, 4, 5}, config.voters.incoming().0);
        assert_eq!(btreeset! {1, 2, 3}, config.voters.outgoing().0);
        // 3 is still tracked while the joint config lasts.
        assert!(progress.contains_key(&3));

        let (config, progress) = changer(config, progress).leave_joint().unwrap();
        assert!(!config.is_joint());
        assert!(!config.auto_leave);
        assert_eq!(btreeset! {1, 2, 4, 5}, config.voters.incoming().0);
        assert!(!progress.contains_key(&3));
    }

    #[test]
    fn test_demotion_stages_learner() {
        let cs = ConfState {
            voters: vec![1, 2, 3],
            ..Default::default()
        };
        let (config, progress) = restore_from(&cs);

        // Demote 3 to learner while entering a joint config.
        let (config, progress) = changer(config, progress)
            .enter_joint(false, &[add_learner(3)])
            .unwrap();
        assert_eq!(btreeset! {3}, config.learners_next);
        assert!(!progress[&3].is_learner, "still a voter of the outgoing half");

        let (config, progress) = changer(config, progress).leave_joint().unwrap();
        assert_eq!(btreeset! {3}, config.learners);
        assert!(progress[&3].is_learner);
        assert_eq!(btreeset! {1, 2}, config.voters.incoming().0);
    }

    #[test]
    fn test_enter_joint_twice_fails() {
        let (config, progress) = restore_from(&ConfState {
            voters: vec![1],
            ..Default::default()
        });
        let (config, progress) = changer(config, progress).enter_joint(false, &[add(2)]).unwrap();
        assert!(changer(config, progress).enter_joint(false, &[add(3)]).is_err());
    }

    #[test]
    fn test_leave_non_joint_fails() {
        let (config, progress) = restore_from(&ConfState {
            voters: vec![1],
            ..Default::default()
        });
        assert!(changer(config, progress).leave_joint().is_err());
    }

    #[test]
    fn test_restore_joint_conf_state() {
        let cs = ConfState {
            voters: vec![1, 2, 3],
            voters_outgoing: vec![1, 2, 4, 6],
            learners: vec![5],
            learners_next: vec![4],
            auto_leave: true,
        };
        let (config, progress) = restore_from(&cs);
        assert!(config.is_joint());
        assert!(cs.equivalent(&config.to_conf_state()));
        for id in [1, 2, 3, 4, 5, 6] {
            assert!(progress.contains_key(&id), "no progress for {}", id);
        }
    }
}
