//! Replica construction parameters.

use crate::types::is_local_target;
use crate::types::PeerId;
use crate::types::NONE;

/// No limit on size-bounded quantities.
pub(crate) const NO_LIMIT: u64 = u64::MAX;

/// Error variants related to configuration.
#[derive(Clone, Debug, thiserror::Error)]
#[derive(PartialEq, Eq)]
pub enum ConfigError {
    /// The replica id is zero or one of the reserved local targets.
    #[error("invalid replica id {0}")]
    InvalidId(PeerId),

    /// `heartbeat_tick` must be greater than zero.
    #[error("heartbeat tick must be greater than 0")]
    HeartbeatTick,

    /// `election_tick` must be greater than `heartbeat_tick`.
    #[error("election tick({election}) must be greater than heartbeat tick({heartbeat})")]
    ElectionTick { election: u64, heartbeat: u64 },

    /// `max_inflight_msgs` must be greater than zero.
    #[error("max inflight messages must be greater than 0")]
    MaxInflightMsgs,

    /// A nonzero `max_inflight_bytes` must cover at least one full
    /// message.
    #[error("max inflight bytes({inflight}) must be >= max message size({msg})")]
    MaxInflightBytes { inflight: u64, msg: u64 },
}

/// Parameters for creating a [`Replica`].
///
/// Build one with struct update syntax over [`Config::new`] and pass it
/// to the constructor, which validates it:
///
/// ```
/// use replicore::Config;
///
/// let config = Config {
///     election_tick: 10,
///     heartbeat_tick: 1,
///     max_size_per_msg: 1024 * 1024,
///     ..Config::new(1)
/// };
/// assert!(config.validate().is_ok());
/// ```
///
/// [`Replica`]: crate::raft::Replica
#[derive(Clone, Debug)]
#[derive(PartialEq, Eq)]
pub struct Config {
    /// The identity of the local replica. Cannot be zero or a reserved
    /// local target id.
    pub id: PeerId,

    /// Number of tick invocations that must pass between elections. A
    /// follower that hears nothing from the leader of the current term
    /// for `election_tick` ticks becomes a candidate. Must be greater
    /// than `heartbeat_tick`; `10 * heartbeat_tick` is a reasonable
    /// default to avoid needless leader switching.
    pub election_tick: u64,

    /// Number of tick invocations between leader heartbeats.
    pub heartbeat_tick: u64,

    /// The last applied index. Only set this when restarting: entries at
    /// or below it are never handed out for application again.
    pub applied: u64,

    /// Emit storage work as `StorageAppend`/`StorageApply` messages to
    /// the local storage targets instead of the `Ready`/`advance`
    /// function-call interface. Writes can then be pipelined; response
    /// messages embedded in each storage message must be delivered after
    /// that write is durable (append) or performed (apply).
    pub async_storage_writes: bool,

    /// Limits the byte size of each append message. Zero allows at most
    /// one entry per message.
    pub max_size_per_msg: u64,

    /// Limits the total byte size of committed entries that may be
    /// handed out for application and not yet acknowledged. Zero
    /// defaults to `max_size_per_msg`.
    pub max_committed_size_per_ready: u64,

    /// Limits the aggregate payload bytes of the uncommitted tail of the
    /// leader's log. Beyond this, proposals are dropped. Zero means no
    /// limit.
    pub max_uncommitted_entries_size: u64,

    /// Limits the number of in-flight append messages to a replicating
    /// peer. Must be greater than zero.
    pub max_inflight_msgs: u64,

    /// Limits the in-flight bytes to a replicating peer, bounding the
    /// effective bandwidth-delay product. Zero means no limit; a nonzero
    /// value must be at least `max_size_per_msg`.
    pub max_inflight_bytes: u64,

    /// The leader steps down when it cannot reach a quorum within an
    /// election timeout. Also enables the leader lease: votes are
    /// refused while a leader is believed alive.
    pub check_quorum: bool,

    /// Run a non-mutating straw poll before a real election, preventing
    /// term inflation from partitioned replicas.
    pub pre_vote: bool,

    /// Followers drop proposals instead of forwarding them to the
    /// leader.
    pub disable_proposal_forwarding: bool,

    /// Turns off propose-time validation of configuration changes
    /// against the active configuration. The pending-change check is
    /// always enforced regardless. Only for hosts that serialize and
    /// verify configuration changes above this core.
    pub disable_conf_change_validation: bool,

    /// The leader steps down when it is removed from the group or
    /// demoted to a learner by an applied configuration change.
    pub step_down_on_removal: bool,
}

impl Config {
    /// A configuration with conventional timing and flow-control limits
    /// for the given replica id.
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            election_tick: 10,
            heartbeat_tick: 1,
            applied: 0,
            async_storage_writes: false,
            max_size_per_msg: NO_LIMIT,
            max_committed_size_per_ready: 0,
            max_uncommitted_entries_size: 0,
            max_inflight_msgs: 256,
            max_inflight_bytes: 0,
            check_quorum: false,
            pre_vote: false,
            disable_proposal_forwarding: false,
            disable_conf_change_validation: false,
            step_down_on_removal: false,
        }
    }

    /// Checks the configuration for sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id == NONE || is_local_target(self.id) {
            return Err(ConfigError::InvalidId(self.id));
        }
        if self.heartbeat_tick == 0 {
            return Err(ConfigError::HeartbeatTick);
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(ConfigError::ElectionTick {
                election: self.election_tick,
                heartbeat: self.heartbeat_tick,
            });
        }
        if self.max_inflight_msgs == 0 {
            return Err(ConfigError::MaxInflightMsgs);
        }
        if self.max_inflight_bytes != 0 && self.max_inflight_bytes < self.max_size_per_msg {
            return Err(ConfigError::MaxInflightBytes {
                inflight: self.max_inflight_bytes,
                msg: self.max_size_per_msg,
            });
        }
        Ok(())
    }

    /// The uncommitted-tail quota with the zero default resolved.
    pub(crate) fn max_uncommitted_size(&self) -> u64 {
        if self.max_uncommitted_entries_size == 0 {
            NO_LIMIT
        } else {
            self.max_uncommitted_entries_size
        }
    }

    /// The apply-batch quota with the zero default resolved.
    pub(crate) fn max_applying_size(&self) -> u64 {
        if self.max_committed_size_per_ready == 0 {
            self.max_size_per_msg
        } else {
            self.max_committed_size_per_ready
        }
    }

    /// The in-flight byte bound with the zero default resolved.
    pub(crate) fn max_inflight_bound(&self) -> u64 {
        if self.max_inflight_bytes == 0 {
            NO_LIMIT
        } else {
            self.max_inflight_bytes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LOCAL_APPEND;

    #[test]
    fn test_validate_rejects_bad_ids() -> anyhow::Result<()> {
        assert_eq!(Err(ConfigError::InvalidId(0)), Config::new(0).validate());
        assert_eq!(
            Err(ConfigError::InvalidId(LOCAL_APPEND)),
            Config::new(LOCAL_APPEND).validate()
        );
        Config::new(1).validate()?;
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_ticks() {
        let c = Config {
            heartbeat_tick: 0,
            ..Config::new(1)
        };
        assert_eq!(Err(ConfigError::HeartbeatTick), c.validate());

        let c = Config {
            election_tick: 1,
            heartbeat_tick: 1,
            ..Config::new(1)
        };
        assert!(matches!(c.validate(), Err(ConfigError::ElectionTick { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_flow_control() {
        let c = Config {
            max_inflight_msgs: 0,
            ..Config::new(1)
        };
        assert_eq!(Err(ConfigError::MaxInflightMsgs), c.validate());

        let c = Config {
            max_size_per_msg: 1024,
            max_inflight_bytes: 512,
            ..Config::new(1)
        };
        assert!(matches!(c.validate(), Err(ConfigError::MaxInflightBytes { .. })));

        let c = Config {
            max_size_per_msg: 1024,
            max_inflight_bytes: 0,
            ..Config::new(1)
        };
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_zero_defaults() {
        let c = Config {
            max_size_per_msg: 4096,
            ..Config::new(1)
        };
        assert_eq!(NO_LIMIT, c.max_uncommitted_size());
        assert_eq!(4096, c.max_applying_size());
        assert_eq!(NO_LIMIT, c.max_inflight_bound());
    }
}
