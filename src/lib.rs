//! The deterministic core of a Raft consensus replica.
//!
//! This crate implements the per-replica state machine of the Raft
//! protocol: roles and elections (with pre-vote and check-quorum),
//! log replication with per-follower flow control and divergence
//! recovery, quorum-based commit advancement, joint-consensus
//! membership changes, and leadership transfer.
//!
//! It deliberately owns nothing else. Durable storage is behind the
//! [`Storage`] trait, time is a logical [`tick`](raft::Replica::tick),
//! and the network is whatever the host does with the emitted
//! [`Message`]s. Given identical inputs in identical order, two replicas
//! produce identical outputs.
//!
//! Hosts drive the core through [`Node`]: feed inputs with
//! [`step`](node::Node::step)/[`tick`](node::Node::tick), drain outputs
//! with [`ready`](node::Node::ready), persist and send, then
//! [`advance`](node::Node::advance) (or run in async-storage-writes mode
//! and answer the emitted storage messages instead).

#![deny(unused_qualifications)]
#![allow(clippy::bool_assert_comparison)]
#![allow(clippy::uninlined_format_args)]

mod config;
mod entry;
mod error;
mod log_slice;
mod log_unstable;
mod message;
mod raft_log;
mod state;
mod types;

pub mod confchange;
pub mod node;
pub mod quorum;
pub mod raft;
pub mod storage;
pub mod tracker;


pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::confchange::ConfChange;
pub use crate::confchange::ConfChangeSingle;
pub use crate::confchange::ConfChangeTransition;
pub use crate::confchange::ConfChangeType;
pub use crate::confchange::ConfChangeV2;
pub use crate::entry::Entry;
pub use crate::entry::EntryPayload;
pub use crate::entry::EntryType;
pub use crate::error::Error;
pub use crate::error::StorageError;
pub use crate::message::Message;
pub use crate::message::MessageType;
pub use crate::node::Node;
pub use crate::node::Ready;
pub use crate::raft::Replica;
pub use crate::state::ConfState;
pub use crate::state::HardState;
pub use crate::state::Snapshot;
pub use crate::state::SnapshotMeta;
pub use crate::state::SoftState;
pub use crate::storage::MemStorage;
pub use crate::storage::Storage;
pub use crate::types::is_local_target;
pub use crate::types::EntryId;
pub use crate::types::LogMark;
pub use crate::types::PeerId;
pub use crate::types::StateRole;
pub use crate::types::LOCAL_APPEND;
pub use crate::types::LOCAL_APPLY;
pub use crate::types::NONE;
