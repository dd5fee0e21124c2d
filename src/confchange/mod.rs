//! Configuration change shapes and the changer that applies them.

mod changer;

use std::fmt;

pub(crate) use changer::Changer;

use crate::types::PeerId;

/// The kind of a single membership change.
#[derive(Clone, Copy, Debug)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ConfChangeType {
    AddNode,
    AddLearnerNode,
    RemoveNode,
    UpdateNode,
}

/// One membership change: add/remove/promote/demote a single peer.
#[derive(Clone, Copy, Debug)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ConfChangeSingle {
    pub change_type: ConfChangeType,
    pub node_id: PeerId,
}

impl ConfChangeSingle {
    pub fn new(change_type: ConfChangeType, node_id: PeerId) -> Self {
        Self { change_type, node_id }
    }
}

/// How a multi-change transitions through the joint configuration.
#[derive(Clone, Copy, Debug, Default)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ConfChangeTransition {
    /// Single changes apply directly; multiple changes enter a joint
    /// configuration that is left automatically.
    #[default]
    Auto,
    /// Always enter a joint configuration, leaving it automatically.
    Implicit,
    /// Always enter a joint configuration; the host must propose an
    /// empty change to leave it.
    Explicit,
}

/// A legacy single-step configuration change.
#[derive(Clone, Debug)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ConfChange {
    pub change_type: ConfChangeType,
    pub node_id: PeerId,
    pub context: Vec<u8>,
}

impl ConfChange {
    /// The equivalent v2 shape, which all application paths use.
    pub fn as_v2(&self) -> ConfChangeV2 {
        ConfChangeV2 {
            transition: ConfChangeTransition::Auto,
            changes: vec![ConfChangeSingle::new(self.change_type, self.node_id)],
            context: self.context.clone(),
        }
    }
}

/// A batch of membership changes, possibly via a joint configuration.
///
/// The zero value (no changes, `Auto` transition) is the "leave joint"
/// request a leader self-proposes when auto-leave is armed.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ConfChangeV2 {
    pub transition: ConfChangeTransition,
    pub changes: Vec<ConfChangeSingle>,
    pub context: Vec<u8>,
}

impl ConfChangeV2 {
    /// Whether this change, applied to the current configuration, must
    /// go through a joint configuration, and if so whether the joint
    /// state is left automatically.
    pub fn enter_joint(&self) -> Option<bool> {
        // Multi-change batches (and explicitly requested transitions) use
        // joint consensus; a lone change applies directly under Auto.
        let use_joint =
            self.transition != ConfChangeTransition::Auto || self.changes.len() > 1;
        if !use_joint {
            return None;
        }
        let auto_leave = matches!(
            self.transition,
            ConfChangeTransition::Auto | ConfChangeTransition::Implicit
        );
        Some(auto_leave)
    }

    /// True iff this is a request to leave a joint configuration.
    pub fn leave_joint(&self) -> bool {
        self.transition == ConfChangeTransition::Auto && self.changes.is_empty()
    }
}

impl fmt::Display for ConfChangeV2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.leave_joint() {
            return write!(f, "leave joint");
        }
        write!(f, "{:?} [", self.transition)?;
        for (i, c) in self.changes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}({})", c.change_type, c.node_id)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_and_leave_joint() {
        let leave = ConfChangeV2::default();
        assert!(leave.leave_joint());
        assert_eq!(None, leave.enter_joint());

        let single = ConfChangeV2 {
            changes: vec![ConfChangeSingle::new(ConfChangeType::AddNode, 4)],
            ..Default::default()
        };
        assert_eq!(None, single.enter_joint());
        assert!(!single.leave_joint());

        let multi = ConfChangeV2 {
            changes: vec![
                ConfChangeSingle::new(ConfChangeType::AddNode, 4),
                ConfChangeSingle::new(ConfChangeType::RemoveNode, 1),
            ],
            ..Default::default()
        };
        assert_eq!(Some(true), multi.enter_joint());

        let explicit = ConfChangeV2 {
            transition: ConfChangeTransition::Explicit,
            changes: vec![ConfChangeSingle::new(ConfChangeType::AddNode, 4)],
            ..Default::default()
        };
        assert_eq!(Some(false), explicit.enter_joint());
    }

    #[test]
    fn test_v1_as_v2() {
        let v1 = ConfChange {
            change_type: ConfChangeType::AddLearnerNode,
            node_id: 7,
            context: vec![1],
        };
        let v2 = v1.as_v2();
        assert_eq!(1, v2.changes.len());
        assert_eq!(None, v2.enter_joint());
    }
}
