use std::fmt;

use crate::entry::Entry;
use crate::state::HardState;
use crate::state::Snapshot;
use crate::types::PeerId;

/// All message kinds that flow through [`Replica::step`].
///
/// Local kinds (`Hup`, `Beat`, `CheckQuorum`, storage responses, ...)
/// carry term zero; protocol kinds carry the sender's term as described
/// in the table on each variant.
///
/// [`Replica::step`]: crate::raft::Replica::step
#[derive(Clone, Copy, Debug)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum MessageType {
    /// Local: start an election (from the tick function).
    Hup,
    /// Local: broadcast a heartbeat (from the leader's tick function).
    Beat,
    /// Propose entries. Carries no term; forwarded to the leader.
    Prop,
    /// Replicate entries. `index`/`log_term` anchor the previous entry.
    App,
    /// Acknowledge or reject an `App`. Released only after the
    /// predicating state is durable.
    AppResp,
    /// Request a vote at a new term.
    Vote,
    /// Answer a `Vote`. Released only after the vote is durable.
    VoteResp,
    /// Straw-poll a vote for the *next* term without mutating state.
    PreVote,
    /// Answer a `PreVote`.
    PreVoteResp,
    /// Stream a snapshot to a follower that has fallen behind the
    /// compacted log.
    Snap,
    /// Leader liveness probe. `commit` is clamped to the peer's match.
    Heartbeat,
    HeartbeatResp,
    /// Local report: a peer became unreachable.
    Unreachable,
    /// Local report: a snapshot stream finished (`reject` on failure).
    SnapStatus,
    /// Local: leader self-check stepping down without an active quorum.
    CheckQuorum,
    /// Ask the leader to hand off leadership to the sender.
    TransferLeader,
    /// Tell the transfer target to campaign immediately.
    TimeoutNow,
    /// Local: make a follower forget its current leader.
    ForgetLeader,
    /// To `LOCAL_APPEND`: persist entries/state; deliver `responses`
    /// once durable.
    StorageAppend,
    StorageAppendResp,
    /// To `LOCAL_APPLY`: apply committed entries; deliver `responses`
    /// once applied.
    StorageApply,
    StorageApplyResp,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Returns the response kind paired with a vote request kind.
pub(crate) fn vote_resp_type(t: MessageType) -> MessageType {
    match t {
        MessageType::Vote => MessageType::VoteResp,
        MessageType::PreVote => MessageType::PreVoteResp,
        _ => unreachable!("not a vote message: {}", t),
    }
}

/// Message kinds that never arrive over the network.
pub(crate) fn is_local_msg(t: MessageType) -> bool {
    matches!(
        t,
        MessageType::Hup
            | MessageType::Beat
            | MessageType::Unreachable
            | MessageType::SnapStatus
            | MessageType::CheckQuorum
            | MessageType::StorageAppend
            | MessageType::StorageAppendResp
            | MessageType::StorageApply
            | MessageType::StorageApplyResp
    )
}

/// Message kinds that answer an earlier request.
pub(crate) fn is_response_msg(t: MessageType) -> bool {
    matches!(
        t,
        MessageType::AppResp
            | MessageType::VoteResp
            | MessageType::PreVoteResp
            | MessageType::HeartbeatResp
            | MessageType::Unreachable
            | MessageType::StorageAppendResp
            | MessageType::StorageApplyResp
    )
}

/// A protocol or local message.
///
/// One flat shape covers every kind; unused fields stay at their
/// defaults. The cost of the width is paid only where a field is set.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Message {
    pub msg_type: MessageType,
    pub to: PeerId,
    pub from: PeerId,
    /// The sender's term, or zero for local and proposal messages.
    pub term: u64,
    /// For `App`/`AppResp`: the term of the entry at `index`. For vote
    /// requests: the term of the candidate's last entry.
    pub log_term: u64,
    /// For `App`: the index of the previous entry. For vote requests:
    /// the candidate's last index. For `AppResp`: the acknowledged (or
    /// rejected) index.
    pub index: u64,
    pub entries: Vec<Entry>,
    /// The sender's commit index, possibly clamped.
    pub commit: u64,
    /// For `App`/`Heartbeat`: what the leader believes the receiver's
    /// match index is. A receiver whose log is shorter has lost entries
    /// and must fail fast.
    pub matched: u64,
    pub reject: bool,
    /// On a rejected `App`: the largest index at which the logs might
    /// agree, refined by [`log_term`](Message::log_term).
    pub reject_hint: u64,
    pub snapshot: Option<Snapshot>,
    /// Campaign context (e.g. the leadership-transfer marker).
    pub context: Vec<u8>,
    /// For `StorageAppend`: the hard state to persist alongside entries.
    pub hard_state: Option<HardState>,
    /// For `StorageAppend`/`StorageApply`: messages to deliver after the
    /// write completes.
    pub responses: Vec<Message>,
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Hup
    }
}

impl Message {
    pub fn new(msg_type: MessageType, to: PeerId, from: PeerId) -> Self {
        Self {
            msg_type,
            to,
            from,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_resp_type() {
        assert_eq!(MessageType::VoteResp, vote_resp_type(MessageType::Vote));
        assert_eq!(MessageType::PreVoteResp, vote_resp_type(MessageType::PreVote));
    }

    #[test]
    fn test_local_and_response_classes_are_disjoint_from_requests() {
        for t in [MessageType::App, MessageType::Vote, MessageType::PreVote, MessageType::Snap] {
            assert!(!is_local_msg(t));
            assert!(!is_response_msg(t));
        }
        assert!(is_local_msg(MessageType::Hup));
        assert!(is_response_msg(MessageType::AppResp));
    }
}
