//! The host-facing façade: readiness snapshots and storage hand-off.

use crate::config::Config;
use crate::config::ConfigError;
use crate::confchange::ConfChangeV2;
use crate::entry::ents_size;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::error::Error;
use crate::message::is_local_msg;
use crate::message::is_response_msg;
use crate::message::Message;
use crate::message::MessageType;
use crate::raft::Replica;
use crate::state::HardState;
use crate::state::Snapshot;
use crate::state::SoftState;
use crate::storage::Storage;
use crate::types::is_local_target;
use crate::types::PeerId;
use crate::types::LOCAL_APPEND;
use crate::types::LOCAL_APPLY;

/// A snapshot of the work the host must perform: state to persist,
/// entries to apply, messages to send.
///
/// In the default (synchronous) mode the contract is: persist
/// `hard_state`, `entries` and `snapshot` durably, apply
/// `committed_entries`, send `messages` (after the persistence step),
/// then call [`Node::advance`].
///
/// With async storage writes the persistence and apply work instead
/// arrives as `StorageAppend`/`StorageApply` messages inside `messages`,
/// each carrying the response messages to deliver once the write is
/// done; `advance` is not used.
#[derive(Clone, Debug, Default)]
#[derive(PartialEq, Eq)]
pub struct Ready {
    /// Updated volatile state, if it changed.
    pub soft_state: Option<SoftState>,
    /// Updated persistent state, if it changed. Must be durable before
    /// sending `messages`.
    pub hard_state: Option<HardState>,
    /// New log entries to persist.
    pub entries: Vec<Entry>,
    /// A snapshot to persist and hand to the state machine.
    pub snapshot: Option<Snapshot>,
    /// Committed entries ready to be applied.
    pub committed_entries: Vec<Entry>,
    /// Outbound messages.
    pub messages: Vec<Message>,
    /// Whether the persistence step must fsync before acknowledging.
    pub must_sync: bool,
}

impl Ready {
    /// True when the batch carries no work at all.
    pub fn is_empty(&self) -> bool {
        self.soft_state.is_none()
            && self.hard_state.is_none()
            && self.entries.is_empty()
            && self.snapshot.is_none()
            && self.committed_entries.is_empty()
            && self.messages.is_empty()
    }
}

/// Drives a [`Replica`]: feeds it inputs and drains its outputs into
/// [`Ready`] batches for the host event loop.
pub struct Node<S: Storage> {
    raft: Replica<S>,
    async_storage_writes: bool,
    prev_soft_state: SoftState,
    prev_hard_state: HardState,
    /// Synchronous mode only: local acknowledgments stepped back into
    /// the replica on `advance`.
    steps_on_advance: Vec<Message>,
}

impl<S: Storage> Node<S> {
    pub fn new(config: &Config, storage: S) -> Result<Self, ConfigError> {
        let raft = Replica::new(config, storage)?;
        let prev_soft_state = raft.soft_state();
        let prev_hard_state = raft.hard_state();
        Ok(Self {
            raft,
            async_storage_writes: config.async_storage_writes,
            prev_soft_state,
            prev_hard_state,
            steps_on_advance: Vec::new(),
        })
    }

    pub fn raft(&self) -> &Replica<S> {
        &self.raft
    }

    /// Advances logical time by one tick.
    pub fn tick(&mut self) {
        self.raft.tick();
    }

    /// Steps a message received from the network or reported by the
    /// host. Local-only kinds are refused here; responses from unknown
    /// peers are dropped.
    pub fn step(&mut self, m: Message) -> Result<(), Error> {
        if is_local_msg(m.msg_type) && !is_local_target(m.from) {
            return Err(Error::StepLocalMsg);
        }
        if is_response_msg(m.msg_type)
            && !is_local_target(m.from)
            && self.raft.tracker().progress(m.from).is_none()
        {
            return Err(Error::StepPeerNotFound);
        }
        self.raft.step(m)
    }

    /// Proposes application data for replication.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(), Error> {
        let id = self.raft.id();
        self.raft.step(Message {
            msg_type: MessageType::Prop,
            from: id,
            entries: vec![Entry::new(0, 0, EntryPayload::Normal(data))],
            ..Default::default()
        })
    }

    /// Proposes a configuration change.
    pub fn propose_conf_change(&mut self, cc: ConfChangeV2) -> Result<(), Error> {
        let id = self.raft.id();
        self.raft.step(Message {
            msg_type: MessageType::Prop,
            from: id,
            entries: vec![Entry::new(0, 0, EntryPayload::ConfChangeV2(cc))],
            ..Default::default()
        })
    }

    /// Applies a committed configuration change to the replica. The host
    /// calls this while applying the corresponding entry.
    pub fn apply_conf_change(&mut self, cc: &ConfChangeV2) -> crate::state::ConfState {
        self.raft.apply_conf_change(cc)
    }

    /// Starts an election.
    pub fn campaign(&mut self) -> Result<(), Error> {
        let id = self.raft.id();
        self.raft.step(Message {
            msg_type: MessageType::Hup,
            from: id,
            ..Default::default()
        })
    }

    /// Asks the current leader to hand leadership to `transferee`.
    pub fn transfer_leader(&mut self, transferee: PeerId) {
        let _ = self.raft.step(Message {
            msg_type: MessageType::TransferLeader,
            from: transferee,
            ..Default::default()
        });
    }

    /// Makes a follower forget its leader, allowing an immediate
    /// campaign without waiting out the lease.
    pub fn forget_leader(&mut self) -> Result<(), Error> {
        let id = self.raft.id();
        self.raft.step(Message {
            msg_type: MessageType::ForgetLeader,
            from: id,
            ..Default::default()
        })
    }

    /// Reports that `id` did not receive the last message sent to it.
    pub fn report_unreachable(&mut self, id: PeerId) {
        let _ = self.raft.step(Message {
            msg_type: MessageType::Unreachable,
            from: id,
            ..Default::default()
        });
    }

    /// Reports the outcome of a snapshot stream to `id`.
    pub fn report_snapshot(&mut self, id: PeerId, reject: bool) {
        let _ = self.raft.step(Message {
            msg_type: MessageType::SnapStatus,
            from: id,
            reject,
            ..Default::default()
        });
    }

    /// Entries may be applied before they are locally durable only in
    /// synchronous mode, where the Ready contract orders the persistence
    /// step first.
    fn apply_unstable_entries(&self) -> bool {
        !self.async_storage_writes
    }

    /// True if a call to [`ready`](Self::ready) would return work.
    pub fn has_ready(&self) -> bool {
        let r = &self.raft;
        if r.soft_state() != self.prev_soft_state {
            return true;
        }
        let hs = r.hard_state();
        if !hs.is_empty() && hs != self.prev_hard_state {
            return true;
        }
        if r.raft_log.next_unstable_snapshot().is_some() {
            return true;
        }
        if !r.msgs.is_empty() || !r.msgs_after_append.is_empty() {
            return true;
        }
        if r.raft_log.has_next_unstable_ents()
            || r.raft_log.has_next_committed_ents(self.apply_unstable_entries())
        {
            return true;
        }
        false
    }

    /// Drains the pending work into a [`Ready`] and accepts it: the
    /// returned batch is now the host's responsibility.
    pub fn ready(&mut self) -> Ready {
        let mut rd = Ready {
            entries: self.raft.raft_log.next_unstable_ents().to_vec(),
            committed_entries: self
                .raft
                .raft_log
                .next_committed_ents(self.apply_unstable_entries()),
            messages: std::mem::take(&mut self.raft.msgs),
            ..Default::default()
        };

        let soft = self.raft.soft_state();
        if soft != self.prev_soft_state {
            rd.soft_state = Some(soft);
            self.prev_soft_state = soft;
        }
        let hard = self.raft.hard_state();
        if hard != self.prev_hard_state {
            rd.hard_state = Some(hard);
        }
        if let Some(snap) = self.raft.raft_log.next_unstable_snapshot() {
            rd.snapshot = Some(snap.clone());
        }
        rd.must_sync = must_sync(&hard, &self.prev_hard_state, rd.entries.len());

        if self.async_storage_writes {
            let need_append = !rd.entries.is_empty()
                || rd.hard_state.is_some()
                || rd.snapshot.is_some()
                || !self.raft.msgs_after_append.is_empty();
            if need_append {
                let m = self.storage_append_msg(&rd);
                rd.messages.push(m);
            }
            if !rd.committed_entries.is_empty() {
                rd.messages.push(self.storage_apply_msg(&rd));
            }
        } else {
            if self.need_storage_append_resp() {
                let m = self.storage_append_resp_msg(&rd);
                self.steps_on_advance.push(m);
            }
            if !rd.committed_entries.is_empty() {
                let m = self.storage_apply_resp_msg(&rd);
                self.steps_on_advance.push(m);
            }
            for m in std::mem::take(&mut self.raft.msgs_after_append) {
                if m.to == self.raft.id() {
                    self.steps_on_advance.push(m);
                } else {
                    rd.messages.push(m);
                }
            }
        }

        // Accept: everything in the batch is on its way.
        if let Some(hs) = rd.hard_state {
            self.prev_hard_state = hs;
        }
        self.raft.msgs_after_append.clear();
        self.raft.raft_log.accept_unstable();
        if let Some(last) = rd.committed_entries.last() {
            let index = last.index;
            let size = ents_size(&rd.committed_entries);
            let allow_unstable = self.apply_unstable_entries();
            self.raft.raft_log.accept_applying(index, size, allow_unstable);
        }
        rd
    }

    /// Synchronous mode: acknowledges the last [`Ready`] after the host
    /// persisted and applied it, delivering the queued local
    /// acknowledgments.
    pub fn advance(&mut self, _rd: Ready) {
        assert!(
            !self.async_storage_writes,
            "advance must not be called when using async storage writes"
        );
        for m in std::mem::take(&mut self.steps_on_advance) {
            let _ = self.raft.step(m);
        }
    }

    /// Whether the host owes an acknowledgment for unstable state:
    /// entries handed out (now or earlier) or a pending snapshot.
    fn need_storage_append_resp(&self) -> bool {
        !self.raft.raft_log.unstable.entries.is_empty()
            || self.raft.raft_log.has_next_or_in_progress_snapshot()
    }

    fn storage_append_msg(&mut self, rd: &Ready) -> Message {
        let mut responses = std::mem::take(&mut self.raft.msgs_after_append);
        if self.need_storage_append_resp() {
            let resp = self.storage_append_resp_msg(rd);
            responses.push(resp);
        }
        Message {
            msg_type: MessageType::StorageAppend,
            to: LOCAL_APPEND,
            from: self.raft.id(),
            entries: rd.entries.clone(),
            snapshot: rd.snapshot.clone(),
            hard_state: rd.hard_state,
            responses,
            ..Default::default()
        }
    }

    /// The acknowledgment of an append batch: carries the mark of the
    /// unstable end it persists, so that a superseding append makes it a
    /// no-op.
    fn storage_append_resp_msg(&self, rd: &Ready) -> Message {
        let mark = self.raft.raft_log.unstable.mark();
        let (index, log_term) = if mark.index > 0 {
            (mark.index, mark.term)
        } else {
            (0, 0)
        };
        Message {
            msg_type: MessageType::StorageAppendResp,
            to: self.raft.id(),
            from: LOCAL_APPEND,
            index,
            log_term,
            snapshot: rd.snapshot.clone(),
            ..Default::default()
        }
    }

    fn storage_apply_msg(&self, rd: &Ready) -> Message {
        Message {
            msg_type: MessageType::StorageApply,
            to: LOCAL_APPLY,
            from: self.raft.id(),
            entries: rd.committed_entries.clone(),
            responses: vec![self.storage_apply_resp_msg(rd)],
            ..Default::default()
        }
    }

    fn storage_apply_resp_msg(&self, rd: &Ready) -> Message {
        Message {
            msg_type: MessageType::StorageApplyResp,
            to: self.raft.id(),
            from: LOCAL_APPLY,
            entries: rd.committed_entries.clone(),
            ..Default::default()
        }
    }
}

/// Whether the state in this batch must hit disk before the host moves
/// on: new entries, or a changed term, vote or lease epoch.
fn must_sync(hs: &HardState, prev: &HardState, entry_count: usize) -> bool {
    entry_count > 0
        || hs.term != prev.term
        || hs.vote != prev.vote
        || hs.lead_epoch != prev.lead_epoch
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::state::ConfState;
    use crate::storage::MemStorage;

    fn single_node_config() -> Config {
        Config {
            election_tick: 10,
            heartbeat_tick: 1,
            ..Config::new(1)
        }
    }

    fn single_node_storage() -> MemStorage {
        MemStorage::new_with_conf_state(ConfState {
            voters: vec![1],
            ..Default::default()
        })
    }

    /// Runs one ready/persist/advance cycle against the storage.
    fn drain(node: &mut Node<MemStorage>, storage: &MemStorage) -> Vec<Message> {
        let mut sent = Vec::new();
        while node.has_ready() {
            let rd = node.ready();
            if let Some(hs) = rd.hard_state {
                storage.set_hard_state(hs);
            }
            if let Some(snap) = &rd.snapshot {
                storage.apply_snapshot(snap.clone()).unwrap();
            }
            storage.append(&rd.entries).unwrap();
            sent.extend(rd.messages.iter().cloned());
            node.advance(rd);
        }
        sent
    }

    #[test]
    fn test_single_node_becomes_leader_and_commits() -> anyhow::Result<()> {
        let storage = single_node_storage();
        let mut node = Node::new(&single_node_config(), storage.clone())?;
        node.campaign()?;
        drain(&mut node, &storage);
        assert_eq!(crate::types::StateRole::Leader, node.raft().state());

        node.propose(b"hello".to_vec())?;
        let mut applied = Vec::new();
        while node.has_ready() {
            let rd = node.ready();
            if let Some(hs) = rd.hard_state {
                storage.set_hard_state(hs);
            }
            storage.append(&rd.entries).unwrap();
            applied.extend(rd.committed_entries.iter().cloned());
            node.advance(rd);
        }
        assert!(applied
            .iter()
            .any(|e| matches!(&e.payload, EntryPayload::Normal(d) if d == b"hello")));
        Ok(())
    }

    #[test]
    fn test_step_refuses_local_messages() -> anyhow::Result<()> {
        let storage = single_node_storage();
        let mut node = Node::new(&single_node_config(), storage)?;
        let res = node.step(Message {
            msg_type: MessageType::Hup,
            from: 2,
            ..Default::default()
        });
        assert_eq!(Err(Error::StepLocalMsg), res);
        Ok(())
    }

    #[test]
    fn test_step_refuses_responses_from_unknown_peers() -> anyhow::Result<()> {
        let storage = single_node_storage();
        let mut node = Node::new(&single_node_config(), storage)?;
        let res = node.step(Message {
            msg_type: MessageType::HeartbeatResp,
            from: 9,
            term: 1,
            ..Default::default()
        });
        assert_eq!(Err(Error::StepPeerNotFound), res);
        Ok(())
    }

    #[test]
    fn test_async_storage_writes_emit_local_messages() -> anyhow::Result<()> {
        let storage = single_node_storage();
        let config = Config {
            async_storage_writes: true,
            ..single_node_config()
        };
        let mut node = Node::new(&config, storage.clone())?;
        node.campaign()?;

        // The first batch carries a StorageAppend with the self-directed
        // vote response embedded.
        let rd = node.ready();
        let append = rd
            .messages
            .iter()
            .find(|m| m.msg_type == MessageType::StorageAppend)
            .expect("no StorageAppend message");
        assert_eq!(LOCAL_APPEND, append.to);
        assert!(append
            .responses
            .iter()
            .any(|resp| resp.msg_type == MessageType::VoteResp));

        // Perform the writes and deliver the responses, as the storage
        // threads would, until the blank entry of the new leader has
        // been applied.
        let mut pending: Vec<Message> = rd.messages.clone();
        let mut saw_append_resp = false;
        let mut saw_apply = false;
        for _ in 0..20 {
            for m in std::mem::take(&mut pending) {
                match m.msg_type {
                    MessageType::StorageAppend => {
                        if let Some(hs) = m.hard_state {
                            storage.set_hard_state(hs);
                        }
                        storage.append(&m.entries).unwrap();
                        for resp in m.responses {
                            saw_append_resp |=
                                resp.msg_type == MessageType::StorageAppendResp;
                            node.step(resp)?;
                        }
                    }
                    MessageType::StorageApply => {
                        saw_apply = true;
                        for resp in m.responses {
                            node.step(resp)?;
                        }
                    }
                    _ => {}
                }
            }
            if !node.has_ready() {
                break;
            }
            pending = node.ready().messages;
        }
        assert!(saw_append_resp);
        assert!(saw_apply);
        assert_eq!(crate::types::StateRole::Leader, node.raft().state());
        assert!(node.raft().applied() > 0);
        Ok(())
    }
}
