//! Error types exposed by this crate.
//!
//! Protocol-level refusals (stale terms, rejections, missing entries) are
//! not errors: they are inputs that drive the state machine. The enums
//! here cover the few conditions a caller can observe directly. Invariant
//! violations, by contrast, panic: consensus safety rests on them and no
//! recovery is possible.

/// Errors returned from [`Replica::step`] and the proposal paths.
///
/// [`Replica::step`]: crate::raft::Replica::step
#[derive(Clone, Debug, thiserror::Error)]
#[derive(PartialEq, Eq)]
pub enum Error {
    /// The proposal was refused and will not be appended. The proposer
    /// should fail fast; no state was changed.
    #[error("raft proposal dropped")]
    ProposalDropped,

    /// A configuration change could not be applied to the current
    /// configuration.
    #[error("conf change: {0}")]
    ConfChange(String),

    /// A local-only message kind arrived from the network.
    #[error("raft: cannot step raft local message")]
    StepLocalMsg,

    /// A response arrived from a peer that is not tracked (e.g. it was
    /// removed from the configuration).
    #[error("raft: cannot step as peer not found")]
    StepPeerNotFound,
}

/// Errors surfaced by [`Storage`] implementations.
///
/// [`Storage`]: crate::storage::Storage
#[derive(Clone, Debug, thiserror::Error)]
#[derive(PartialEq, Eq)]
pub enum StorageError {
    /// The requested index predates the last snapshot. A replication
    /// read hitting this switches the peer to snapshot delivery.
    #[error("requested index is unavailable due to compaction")]
    Compacted,

    /// The requested index is past the last known entry.
    #[error("requested entry at index is unavailable")]
    Unavailable,

    /// A snapshot exists but cannot be produced right now; retry later
    /// without changing any peer state.
    #[error("snapshot is temporarily unavailable")]
    SnapshotTemporarilyUnavailable,

    /// The snapshot that was being created is older than an already
    /// installed one.
    #[error("requested snapshot is out of date")]
    SnapshotOutOfDate,
}
