//! Quorum computation over (possibly joint) voter sets.

mod joint;
mod majority;

use std::collections::BTreeSet;
use std::fmt;

pub use joint::JointConfig;
pub use majority::MajorityConfig;

use crate::state::ConfState;
use crate::types::PeerId;

/// The outcome of tallying one (pre-)election.
#[derive(Clone, Copy, Debug)]
#[derive(PartialEq, Eq)]
pub enum VoteResult {
    /// Not enough information yet; outstanding votes could still decide
    /// it either way.
    Pending,
    Lost,
    Won,
}

/// The active membership: a (possibly joint) voter configuration plus
/// learners.
///
/// Invariants (enforced by the configuration changer):
/// - voters and learners are disjoint;
/// - `learners_next` is a subset of the outgoing voters;
/// - `auto_leave` is only set on a joint configuration.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
pub struct QuorumConfig {
    pub(crate) voters: JointConfig,
    pub(crate) learners: BTreeSet<PeerId>,
    /// Outgoing voters that become learners when the joint configuration
    /// is left. They cannot be learners yet: a peer must not be a voter
    /// of one half and a learner at the same time.
    pub(crate) learners_next: BTreeSet<PeerId>,
    pub(crate) auto_leave: bool,
}

impl QuorumConfig {
    /// True while the configuration carries an outgoing voter set.
    pub fn is_joint(&self) -> bool {
        !self.voters.outgoing().is_empty()
    }

    /// The wire representation of this configuration.
    pub fn to_conf_state(&self) -> ConfState {
        ConfState {
            voters: self.voters.incoming().iter().copied().collect(),
            learners: self.learners.iter().copied().collect(),
            voters_outgoing: self.voters.outgoing().iter().copied().collect(),
            learners_next: self.learners_next.iter().copied().collect(),
            auto_leave: self.auto_leave,
        }
    }
}

impl fmt::Display for QuorumConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "voters={}", self.voters)?;
        if !self.learners.is_empty() {
            write!(f, " learners={:?}", self.learners)?;
        }
        if !self.learners_next.is_empty() {
            write!(f, " learners_next={:?}", self.learners_next)?;
        }
        if self.auto_leave {
            write!(f, " autoleave")?;
        }
        Ok(())
    }
}
