use std::fmt;

/// The identity of a replica in a group.
///
/// `0` is reserved as [`NONE`], and the two largest values are reserved as
/// local storage targets. See [`is_local_target`].
pub type PeerId = u64;

/// A placeholder id used when there is no leader.
pub const NONE: PeerId = 0;

/// A reference to the local thread that saves unstable log entries and
/// snapshots to stable storage. Used as a target for `StorageAppend`
/// messages when async storage writes are enabled.
pub const LOCAL_APPEND: PeerId = u64::MAX;

/// A reference to the local thread that applies committed log entries to
/// the local state machine. Used as a target for `StorageApply` messages
/// when async storage writes are enabled.
pub const LOCAL_APPLY: PeerId = u64::MAX - 1;

/// Returns true if the id refers to one of the local storage threads
/// rather than a remote peer.
pub fn is_local_target(id: PeerId) -> bool {
    id == LOCAL_APPEND || id == LOCAL_APPLY
}

/// The identifier of a log entry: its term and index.
///
/// Also used as the "previous entry" anchor of an append: the receiver
/// accepts the appended entries only if its log contains this exact id.
#[derive(Clone, Copy, Debug, Default)]
#[derive(PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct EntryId {
    pub term: u64,
    pub index: u64,
}

impl EntryId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.term, self.index)
    }
}

/// A position in the log paired with the *accepted term* under which it
/// was observed.
///
/// Unlike [`EntryId`], the `term` here is not the term of the entry at
/// `index`. It is the term of the leader whose log is known to contain
/// that index. A commit index may only be advanced under a mark whose
/// term equals the observer's accepted term, which guarantees the
/// observer's log through `index` is a prefix of that leader's log.
#[derive(Clone, Copy, Debug, Default)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct LogMark {
    pub term: u64,
    pub index: u64,
}

impl LogMark {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.term, self.index)
    }
}

/// The role of a replica within its group.
#[derive(Clone, Copy, Debug, Default)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum StateRole {
    #[default]
    Follower,
    Candidate,
    Leader,
    PreCandidate,
}

impl fmt::Display for StateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateRole::Follower => "Follower",
            StateRole::Candidate => "Candidate",
            StateRole::Leader => "Leader",
            StateRole::PreCandidate => "PreCandidate",
        };
        write!(f, "{}", name)
    }
}

/// The flavor of an election campaign.
#[derive(Clone, Copy, Debug)]
#[derive(PartialEq, Eq)]
pub(crate) enum CampaignType {
    /// The first phase of an election when pre-vote is enabled: a straw
    /// poll at `term + 1` that does not mutate any persistent state.
    PreElection,
    /// A normal (time-based) election.
    Election,
    /// An election initiated by a leadership transfer. Carries a marker
    /// context so that recipients bypass their leader lease check.
    Transfer,
}

/// Context bytes attached to vote requests of a transfer campaign.
pub(crate) const CAMPAIGN_TRANSFER_CONTEXT: &[u8] = b"CampaignTransfer";
