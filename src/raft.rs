use rand::rngs::StdRng;
use rand::RngCore;
use rand::SeedableRng;

use crate::config::Config;
use crate::config::ConfigError;
use crate::confchange::Changer;
use crate::confchange::ConfChangeV2;
use crate::entry::payloads_size;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::error::Error;
use crate::error::StorageError;
use crate::log_slice::LogSlice;
use crate::message::vote_resp_type;
use crate::message::Message;
use crate::message::MessageType;
use crate::quorum::QuorumConfig;
use crate::quorum::VoteResult;
use crate::raft_log::RaftLog;
use crate::state::ConfState;
use crate::state::HardState;
use crate::state::Snapshot;
use crate::state::SoftState;
use crate::storage::Storage;
use crate::tracker::Progress;
use crate::tracker::ProgressMap;
use crate::tracker::ProgressState;
use crate::tracker::ProgressTracker;
use crate::tracker::VoteTracker;
use crate::types::CampaignType;
use crate::types::EntryId;
use crate::types::LogMark;
use crate::types::PeerId;
use crate::types::StateRole;
use crate::types::CAMPAIGN_TRANSFER_CONTEXT;
use crate::types::NONE;

/// The deterministic core of one replica.
///
/// All inputs arrive through [`step`](Replica::step) (protocol messages,
/// storage acknowledgments, proposals) and [`tick`](Replica::tick)
/// (logical time). Outputs accumulate in two queues: `msgs`, to transmit
/// immediately, and `msgs_after_append`, to release only once the
/// unstable state they are predicated on is durable. Hosts usually drive
/// this through [`Node`](crate::node::Node) rather than directly.
pub struct Replica<S: Storage> {
    pub(crate) id: PeerId,

    pub(crate) term: u64,
    pub(crate) vote: PeerId,

    pub(crate) raft_log: RaftLog<S>,

    max_msg_size: u64,
    max_uncommitted_size: u64,

    pub(crate) tracker: ProgressTracker,
    election_votes: VoteTracker,

    pub(crate) state: StateRole,
    is_learner: bool,

    /// Outbound messages to transmit immediately. Never self-addressed.
    pub(crate) msgs: Vec<Message>,
    /// Outbound messages gated on durability of the accumulated unstable
    /// state (term, vote, entries, snapshot). Only `AppResp`, `VoteResp`
    /// and `PreVoteResp` go here; they may target this replica itself
    /// (self-acknowledgment).
    pub(crate) msgs_after_append: Vec<Message>,

    pub(crate) lead: PeerId,
    /// The liveness epoch under which `lead` leads; carried through
    /// `HardState`, cleared when the term moves.
    pub(crate) lead_epoch: u64,
    /// Nonzero while a graceful leadership handoff is in progress.
    pub(crate) lead_transferee: PeerId,

    /// At most one configuration change may be pending (in the log, but
    /// not yet applied). Proposing another is refused until `applied`
    /// catches up to this index.
    pending_conf_index: u64,
    /// Payload bytes of the uncommitted tail appended by this leader.
    /// Reset on term changes.
    uncommitted_size: u64,

    election_elapsed: u64,
    heartbeat_elapsed: u64,

    max_inflight_msgs: u64,
    max_inflight_bytes: u64,
    check_quorum: bool,
    pre_vote: bool,

    heartbeat_timeout: u64,
    election_timeout: u64,
    /// Drawn from `[election_timeout, 2 * election_timeout - 1]` on each
    /// role reset.
    randomized_election_timeout: u64,
    disable_proposal_forwarding: bool,
    disable_conf_change_validation: bool,
    step_down_on_removal: bool,

    rng: Box<dyn RngCore + Send>,
}

impl<S: Storage> Replica<S> {
    /// Creates a replica from a validated configuration and its storage.
    ///
    /// Panics if the storage cannot be read or holds a state that
    /// contradicts itself; a replica must not run on a log it cannot
    /// trust.
    pub fn new(config: &Config, storage: S) -> Result<Self, ConfigError> {
        Self::with_rng(config, storage, Box::new(StdRng::from_entropy()))
    }

    /// Like [`new`](Self::new), with an injected randomness source for
    /// deterministic election jitter.
    pub fn with_rng(
        config: &Config,
        storage: S,
        rng: Box<dyn RngCore + Send>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let raft_log = RaftLog::new(storage, config.max_applying_size());
        let (hard_state, conf_state) = raft_log
            .storage
            .initial_state()
            .expect("reading initial state from storage");

        let mut r = Self {
            id: config.id,
            term: 0,
            vote: NONE,
            raft_log,
            max_msg_size: config.max_size_per_msg,
            max_uncommitted_size: config.max_uncommitted_size(),
            tracker: ProgressTracker::default(),
            election_votes: VoteTracker::default(),
            state: StateRole::Follower,
            is_learner: false,
            msgs: Vec::new(),
            msgs_after_append: Vec::new(),
            lead: NONE,
            lead_epoch: 0,
            lead_transferee: NONE,
            pending_conf_index: 0,
            uncommitted_size: 0,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            max_inflight_msgs: config.max_inflight_msgs,
            max_inflight_bytes: config.max_inflight_bound(),
            check_quorum: config.check_quorum,
            pre_vote: config.pre_vote,
            heartbeat_timeout: config.heartbeat_tick,
            election_timeout: config.election_tick,
            randomized_election_timeout: 0,
            disable_proposal_forwarding: config.disable_proposal_forwarding,
            disable_conf_change_validation: config.disable_conf_change_validation,
            step_down_on_removal: config.step_down_on_removal,
            rng,
        };

        let changer = Changer {
            config: Default::default(),
            progress: Default::default(),
            max_inflight_msgs: r.max_inflight_msgs,
            max_inflight_bytes: r.max_inflight_bytes,
            last_index: r.raft_log.last_index(),
        };
        let (cfg, progress) = changer
            .restore(&conf_state)
            .unwrap_or_else(|e| panic!("unable to restore config {:?}: {}", conf_state, e));
        let restored = r.switch_to_config(cfg, progress);
        assert!(
            conf_state.equivalent(&restored),
            "restored conf state {:?} differs from persisted {:?}",
            restored,
            conf_state
        );

        if !hard_state.is_empty() {
            r.load_state(&hard_state);
        }
        if config.applied > 0 {
            r.raft_log.applied_to(config.applied, 0);
        }

        let (term, lead) = (r.term, r.lead);
        r.become_follower(term, lead);

        let last = r.raft_log.last_entry_id();
        tracing::info!(
            "new replica {} [peers: {:?}, term: {}, commit: {}, applied: {}, last: {}]",
            r.id,
            r.tracker.voter_ids(),
            r.term,
            r.raft_log.committed,
            r.raft_log.applied,
            last
        );
        Ok(r)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn state(&self) -> StateRole {
        self.state
    }

    pub fn lead(&self) -> PeerId {
        self.lead
    }

    /// True while this replica is a learner under the active
    /// configuration.
    pub fn is_learner(&self) -> bool {
        self.is_learner
    }

    pub fn committed(&self) -> u64 {
        self.raft_log.committed
    }

    pub fn applied(&self) -> u64 {
        self.raft_log.applied
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub(crate) fn soft_state(&self) -> SoftState {
        SoftState {
            lead: self.lead,
            state: self.state,
        }
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.raft_log.committed,
            lead: self.lead,
            lead_epoch: self.lead_epoch,
        }
    }

    fn load_state(&mut self, hs: &HardState) {
        assert!(
            hs.commit >= self.raft_log.committed && hs.commit <= self.raft_log.last_index(),
            "{} hard state commit {} is out of range [{}, {}]",
            self.id,
            hs.commit,
            self.raft_log.committed,
            self.raft_log.last_index()
        );
        self.raft_log.committed = hs.commit;
        self.term = hs.term;
        self.vote = hs.vote;
        self.lead = hs.lead;
        self.lead_epoch = hs.lead_epoch;
    }

    // --- sending ---

    /// Schedules a message for sending. Responses that are predicated on
    /// unstable state go to the after-append queue; everything else is
    /// transmitted immediately.
    fn send(&mut self, mut m: Message) {
        if m.from == NONE {
            m.from = self.id;
        }
        match m.msg_type {
            MessageType::Vote
            | MessageType::VoteResp
            | MessageType::PreVote
            | MessageType::PreVoteResp => {
                // Campaign messages carry the term they campaign in (or
                // answer for), which differs from the local term for
                // pre-votes.
                assert!(m.term != 0, "term unset on {}", m.msg_type);
            }
            _ => {
                assert!(m.term == 0, "term set on {} (was {})", m.msg_type, m.term);
                // Proposals are forwarded as-is: they carry no term so
                // they survive crossing a term boundary.
                if m.msg_type != MessageType::Prop {
                    m.term = self.term;
                }
            }
        }
        match m.msg_type {
            MessageType::AppResp | MessageType::VoteResp | MessageType::PreVoteResp => {
                // An acknowledgment of an append or a vote must not be
                // released before the acknowledged state is durable; the
                // queue is flushed only after the next completed append.
                self.msgs_after_append.push(m);
            }
            _ => {
                assert!(m.to != self.id, "self-addressed {}", m.msg_type);
                self.msgs.push(m);
            }
        }
    }

    /// Sends an append (or a snapshot, if the log is truncated past the
    /// peer's next index) carrying entries the peer is missing and the
    /// current commit index. Returns false if the peer's flow is paused
    /// or up to date.
    fn maybe_send_append(&mut self, to: PeerId) -> bool {
        let last = self.raft_log.last_index();
        let commit = self.raft_log.committed;
        let Some(pr) = self.tracker.progress(to) else {
            return false;
        };
        if !pr.should_send_msg_app(last, commit) {
            return false;
        }

        let prev_index = pr.next - 1;
        let Ok(prev_term) = self.raft_log.term(prev_index) else {
            // The log was likely truncated at or above next; this peer
            // can only be caught up with a snapshot.
            return self.maybe_send_snapshot(to);
        };

        let mut entries = Vec::new();
        if pr.can_send_entries(last) {
            match self.raft_log.entries(pr.next, self.max_msg_size) {
                Ok(ents) => entries = ents,
                Err(_) => return self.maybe_send_snapshot(to),
            }
        }

        let matched = pr.matched;
        let count = entries.len();
        let bytes = payloads_size(&entries);
        self.send(Message {
            msg_type: MessageType::App,
            to,
            index: prev_index,
            log_term: prev_term,
            entries,
            commit,
            matched,
            ..Default::default()
        });
        let pr = self.tracker.progress_mut(to).expect("progress vanished");
        pr.sent_entries(count, bytes);
        pr.sent_commit(commit);
        true
    }

    /// Streams the current snapshot to a peer whose log cannot be caught
    /// up from ours. Returns false without any state change when the
    /// snapshot is temporarily unavailable or the peer looks dead.
    fn maybe_send_snapshot(&mut self, to: PeerId) -> bool {
        let pr = self.tracker.progress(to).expect("no progress for snapshot target");
        if !pr.recent_active {
            tracing::debug!("ignore sending snapshot to {}: not recently active", to);
            return false;
        }

        let snapshot = match self.raft_log.snapshot() {
            Ok(s) => s,
            Err(StorageError::SnapshotTemporarilyUnavailable) => {
                tracing::debug!("{} snapshot to {} deferred: temporarily unavailable", self.id, to);
                return false;
            }
            Err(e) => panic!("unexpected error loading snapshot: {}", e),
        };
        assert!(!snapshot.is_empty(), "need non-empty snapshot");
        let (sindex, sterm) = (snapshot.meta.index, snapshot.meta.term);
        self.tracker.progress_mut(to).expect("progress vanished").become_snapshot(sindex);
        tracing::debug!(
            "{} [firstindex: {}, commit: {}] sent snapshot[index: {}, term: {}] to {} and paused replication",
            self.id,
            self.raft_log.first_index(),
            self.raft_log.committed,
            sindex,
            sterm,
            to
        );
        self.send(Message {
            msg_type: MessageType::Snap,
            to,
            snapshot: Some(snapshot),
            ..Default::default()
        });
        true
    }

    fn send_heartbeat(&mut self, to: PeerId) {
        let Some(pr) = self.tracker.progress(to) else {
            return;
        };
        // The peer might not have all committed entries; a commit index
        // beyond its matched prefix must not be announced to it.
        let commit = pr.matched.min(self.raft_log.committed);
        let matched = pr.matched;
        self.send(Message {
            msg_type: MessageType::Heartbeat,
            to,
            commit,
            matched,
            ..Default::default()
        });
        self.tracker.progress_mut(to).expect("progress vanished").sent_commit(commit);
    }

    fn bcast_append(&mut self) {
        let peers: Vec<PeerId> = self.tracker.progress.keys().copied().collect();
        for to in peers {
            if to != self.id {
                self.maybe_send_append(to);
            }
        }
    }

    fn bcast_heartbeat(&mut self) {
        let peers: Vec<PeerId> = self.tracker.progress.keys().copied().collect();
        for to in peers {
            if to != self.id {
                self.send_heartbeat(to);
            }
        }
    }

    // --- log application ---

    pub(crate) fn applied_to(&mut self, index: u64, size: u64) {
        let new_applied = index.max(self.raft_log.applied);
        self.raft_log.applied_to(new_applied, size);

        if self.tracker.config.auto_leave
            && new_applied >= self.pending_conf_index
            && self.state == StateRole::Leader
        {
            // The joint configuration is fully applied; propose leaving
            // it. The proposal is empty and can never be refused on
            // size, but it can be refused during a leadership transfer,
            // in which case a later applied entry retries it.
            let m = Message {
                msg_type: MessageType::Prop,
                from: self.id,
                entries: vec![Entry::new(
                    0,
                    0,
                    EntryPayload::ConfChangeV2(ConfChangeV2::default()),
                )],
                ..Default::default()
            };
            match self.step(m) {
                Ok(()) => {
                    tracing::info!(
                        "{} initiating automatic transition out of joint configuration {}",
                        self.id,
                        self.tracker.config
                    );
                }
                Err(e) => {
                    tracing::debug!(
                        "{} not leaving joint configuration {}: {}",
                        self.id,
                        self.tracker.config,
                        e
                    );
                }
            }
        }
    }

    pub(crate) fn applied_snap(&mut self, index: u64) {
        self.raft_log.stable_snap_to(index);
        self.applied_to(index, 0);
    }

    /// Advances the commit index to the largest quorum-replicated index
    /// whose entry carries the current term. Counting replicas is only
    /// sound for entries of the leader's own term; earlier entries
    /// commit transitively.
    fn maybe_commit(&mut self) -> bool {
        let index = self.tracker.committed();
        if index <= self.raft_log.committed {
            return false;
        }
        if !self.raft_log.match_term(EntryId::new(self.term, index)) {
            return false;
        }
        self.raft_log.commit_to(LogMark::new(self.term, index));
        true
    }

    fn reset(&mut self, term: u64) {
        if self.term != term {
            self.term = term;
            self.vote = NONE;
            self.lead_epoch = 0;
        }
        self.lead = NONE;

        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.reset_randomized_election_timeout();

        self.abort_leader_transfer();

        self.election_votes.reset_votes();
        let last_index = self.raft_log.last_index();
        let (id, max_msgs, max_bytes) = (self.id, self.max_inflight_msgs, self.max_inflight_bytes);
        self.tracker.visit(|pid, pr| {
            let is_learner = pr.is_learner;
            *pr = Progress::new(last_index + 1, max_msgs, max_bytes);
            pr.is_learner = is_learner;
            if pid == id {
                pr.matched = last_index;
            }
        });

        self.pending_conf_index = 0;
        self.uncommitted_size = 0;
    }

    /// Stamps and appends proposed entries to the local log, recording
    /// the self-acknowledgment that will arrive once they are durable.
    /// Returns false iff the uncommitted-tail quota refuses the payload.
    fn append_entry(&mut self, mut entries: Vec<Entry>) -> bool {
        let last = self.raft_log.last_entry_id();
        for (i, e) in entries.iter_mut().enumerate() {
            e.term = self.term;
            e.index = last.index + 1 + i as u64;
        }
        if !self.increase_uncommitted_size(&entries) {
            tracing::warn!(
                "{} appending new entries would exceed the uncommitted entry size limit; dropping proposal",
                self.id
            );
            return false;
        }

        let slice = LogSlice::new(self.term, last, entries);
        if let Err(e) = slice.valid() {
            panic!("{} leader built an invalid append: {}", self.id, e);
        }
        assert!(
            self.raft_log.append(slice),
            "{} leader could not append to its log",
            self.id
        );

        // Appending locally plays the role of an append message to our
        // own "acceptor": advance the local progress as if it was sent,
        // and queue the acknowledgment behind the durable write.
        let next = self.raft_log.last_index() + 1;
        self.tracker.progress_mut(self.id).expect("no local progress").next = next;
        self.send(Message {
            msg_type: MessageType::AppResp,
            to: self.id,
            index: next - 1,
            ..Default::default()
        });
        true
    }

    // --- ticks ---

    /// Advances logical time by one tick.
    pub fn tick(&mut self) {
        match self.state {
            StateRole::Leader => self.tick_heartbeat(),
            _ => self.tick_election(),
        }
    }

    fn tick_election(&mut self) {
        self.election_elapsed += 1;
        if self.promotable() && self.past_election_timeout() {
            self.election_elapsed = 0;
            let m = Message {
                msg_type: MessageType::Hup,
                from: self.id,
                ..Default::default()
            };
            if let Err(e) = self.step(m) {
                tracing::debug!("error occurred during election: {}", e);
            }
        }
    }

    fn tick_heartbeat(&mut self) {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        if self.election_elapsed >= self.election_timeout {
            self.election_elapsed = 0;
            if self.check_quorum {
                let m = Message {
                    msg_type: MessageType::CheckQuorum,
                    from: self.id,
                    ..Default::default()
                };
                if let Err(e) = self.step(m) {
                    tracing::debug!("error occurred during quorum check: {}", e);
                }
            }
            // A transfer that did not finish within an election timeout
            // is abandoned and the leader resumes accepting proposals.
            if self.state == StateRole::Leader && self.lead_transferee != NONE {
                self.abort_leader_transfer();
            }
        }

        if self.state != StateRole::Leader {
            return;
        }

        if self.heartbeat_elapsed >= self.heartbeat_timeout {
            self.heartbeat_elapsed = 0;
            let m = Message {
                msg_type: MessageType::Beat,
                from: self.id,
                ..Default::default()
            };
            if let Err(e) = self.step(m) {
                tracing::debug!("error occurred during heartbeat: {}", e);
            }
        }
    }

    // --- role transitions ---

    pub(crate) fn become_follower(&mut self, term: u64, lead: PeerId) {
        self.reset(term);
        self.lead = lead;
        self.state = StateRole::Follower;
        tracing::info!("{} became follower at term {}", self.id, self.term);
    }

    fn become_candidate(&mut self) {
        assert!(
            self.state != StateRole::Leader,
            "invalid transition [leader -> candidate]"
        );
        self.reset(self.term + 1);
        self.vote = self.id;
        self.state = StateRole::Candidate;
        tracing::info!("{} became candidate at term {}", self.id, self.term);
    }

    fn become_pre_candidate(&mut self) {
        assert!(
            self.state != StateRole::Leader,
            "invalid transition [leader -> pre-candidate]"
        );
        // A pre-candidacy changes only the role and the vote tally; the
        // term and the vote stay untouched until the straw poll is won.
        self.election_votes.reset_votes();
        self.lead = NONE;
        self.state = StateRole::PreCandidate;
        tracing::info!("{} became pre-candidate at term {}", self.id, self.term);
    }

    fn become_leader(&mut self) {
        assert!(
            self.state != StateRole::Follower,
            "invalid transition [follower -> leader]"
        );
        self.reset(self.term);
        self.lead = self.id;
        self.state = StateRole::Leader;

        // The local replica is trivially replicating; reset() has
        // already positioned its progress at the last index.
        let pr = self.tracker.progress_mut(self.id).expect("no local progress");
        pr.become_replicate();
        pr.recent_active = true;

        // There may or may not be a pending config change in the tail;
        // conservatively delay new ones until the whole tail is applied,
        // rather than scanning it here.
        self.pending_conf_index = self.raft_log.last_index();

        // The empty payload registers as zero bytes, so the quota cannot
        // refuse it.
        let empty = vec![Entry::new(0, 0, EntryPayload::default())];
        assert!(self.append_entry(empty), "empty entry was dropped");
        tracing::info!("{} became leader at term {}", self.id, self.term);
    }

    // --- elections ---

    fn hup(&mut self, t: CampaignType) {
        if self.state == StateRole::Leader {
            tracing::debug!("{} ignoring Hup because already leader", self.id);
            return;
        }
        if !self.promotable() {
            tracing::warn!("{} is unpromotable and can not campaign", self.id);
            return;
        }
        if self.has_unapplied_conf_changes() {
            tracing::warn!(
                "{} cannot campaign at term {} since there are still pending configuration changes to apply",
                self.id,
                self.term
            );
            return;
        }

        tracing::info!("{} is starting a new election at term {}", self.id, self.term);
        self.campaign(t);
    }

    /// True when this replica may seek leadership: it is a tracked
    /// non-learner member with no snapshot pending.
    fn promotable(&self) -> bool {
        self.tracker
            .progress(self.id)
            .map_or(false, |pr| !pr.is_learner)
            && !self.raft_log.has_next_or_in_progress_snapshot()
    }

    fn has_unapplied_conf_changes(&self) -> bool {
        if self.raft_log.applied >= self.raft_log.committed {
            return false;
        }
        let mut found = false;
        // Paginate the scan: the unapplied tail may be arbitrarily long.
        let (lo, hi) = (self.raft_log.applied + 1, self.raft_log.committed + 1);
        let page_size = self.raft_log.max_applying_size();
        self.raft_log
            .scan(lo, hi, page_size, |entries| {
                if entries.iter().any(|e| e.payload.is_conf_change()) {
                    found = true;
                    return false;
                }
                true
            })
            .unwrap_or_else(|e| panic!("error scanning unapplied entries [{}, {}): {}", lo, hi, e));
        found
    }

    fn campaign(&mut self, t: CampaignType) {
        let (vote_msg, term) = if t == CampaignType::PreElection {
            self.become_pre_candidate();
            // The straw poll is for the term we would campaign at.
            (MessageType::PreVote, self.term + 1)
        } else {
            self.become_candidate();
            (MessageType::Vote, self.term)
        };

        let last = self.raft_log.last_entry_id();
        for id in self.tracker.voter_ids() {
            if id == self.id {
                // Vote for ourselves, counted once the vote is durable:
                // the response is routed through the after-append queue
                // back into step.
                self.send(Message {
                    msg_type: vote_resp_type(vote_msg),
                    to: id,
                    term,
                    ..Default::default()
                });
                continue;
            }
            tracing::info!(
                "{} [logterm: {}, index: {}] sent {} request to {} at term {}",
                self.id,
                last.term,
                last.index,
                vote_msg,
                id,
                self.term
            );
            let context = if t == CampaignType::Transfer {
                CAMPAIGN_TRANSFER_CONTEXT.to_vec()
            } else {
                Vec::new()
            };
            self.send(Message {
                msg_type: vote_msg,
                to: id,
                term,
                index: last.index,
                log_term: last.term,
                context,
                ..Default::default()
            });
        }
    }

    fn poll(&mut self, from: PeerId, t: MessageType, granted: bool) -> (usize, usize, VoteResult) {
        if granted {
            tracing::info!("{} received {} from {} at term {}", self.id, t, from, self.term);
        } else {
            tracing::info!("{} received {} rejection from {} at term {}", self.id, t, from, self.term);
        }
        self.election_votes.record_vote(from, granted);
        self.election_votes.tally_votes(&self.tracker.config.voters)
    }

    // --- input dispatch ---

    /// Feeds one message into the state machine.
    pub fn step(&mut self, m: Message) -> Result<(), Error> {
        if m.term == 0 {
            // Local message.
        } else if m.term > self.term {
            if matches!(m.msg_type, MessageType::Vote | MessageType::PreVote) {
                let force = m.context == CAMPAIGN_TRANSFER_CONTEXT;
                let in_lease = self.check_quorum
                    && self.lead != NONE
                    && self.election_elapsed < self.election_timeout;
                if !force && in_lease {
                    // Within the lease of a live leader, neither the term
                    // moves nor a vote is granted.
                    let last = self.raft_log.last_entry_id();
                    tracing::info!(
                        "{} [logterm: {}, index: {}, vote: {}] ignored {} from {} [logterm: {}, index: {}] at term {}: lease is not expired (remaining ticks: {})",
                        self.id,
                        last.term,
                        last.index,
                        self.vote,
                        m.msg_type,
                        m.from,
                        m.log_term,
                        m.index,
                        self.term,
                        self.election_timeout - self.election_elapsed
                    );
                    return Ok(());
                }
            }
            match m.msg_type {
                // Never change the term in response to a pre-vote.
                MessageType::PreVote => {}
                // A granted pre-vote carries the future term we asked
                // about; the term moves only when the campaign is won.
                MessageType::PreVoteResp if !m.reject => {}
                _ => {
                    tracing::info!(
                        "{} [term: {}] received a {} message with higher term from {} [term: {}]",
                        self.id,
                        self.term,
                        m.msg_type,
                        m.from,
                        m.term
                    );
                    if matches!(
                        m.msg_type,
                        MessageType::App | MessageType::Heartbeat | MessageType::Snap
                    ) {
                        self.become_follower(m.term, m.from);
                    } else {
                        self.become_follower(m.term, NONE);
                    }
                }
            }
        } else if m.term < self.term {
            if (self.check_quorum || self.pre_vote)
                && matches!(m.msg_type, MessageType::Heartbeat | MessageType::App)
            {
                // A leader at a lower term cannot learn about our term
                // from ignored vote requests (the lease refuses them);
                // an empty append response carrying our term forces it
                // to step down.
                self.send(Message::new(MessageType::AppResp, m.from, NONE));
            } else if m.msg_type == MessageType::PreVote {
                let last = self.raft_log.last_entry_id();
                tracing::info!(
                    "{} [logterm: {}, index: {}, vote: {}] rejected {} from {} [logterm: {}, index: {}] at term {}",
                    self.id,
                    last.term,
                    last.index,
                    self.vote,
                    m.msg_type,
                    m.from,
                    m.log_term,
                    m.index,
                    self.term
                );
                self.send(Message {
                    msg_type: MessageType::PreVoteResp,
                    to: m.from,
                    term: self.term,
                    reject: true,
                    ..Default::default()
                });
            } else {
                tracing::info!(
                    "{} [term: {}] ignored a {} message with lower term from {} [term: {}]",
                    self.id,
                    self.term,
                    m.msg_type,
                    m.from,
                    m.term
                );
            }
            return Ok(());
        }

        match m.msg_type {
            MessageType::Hup => {
                if self.pre_vote {
                    self.hup(CampaignType::PreElection);
                } else {
                    self.hup(CampaignType::Election);
                }
            }

            MessageType::StorageAppendResp => {
                // The snapshot precedes the entries, and is acknowledged
                // first.
                if let Some(snap) = &m.snapshot {
                    self.applied_snap(snap.meta.index);
                }
                if m.index != 0 {
                    self.raft_log.stable_to(LogMark::new(m.log_term, m.index));
                }
            }

            MessageType::StorageApplyResp => {
                if let Some(last) = m.entries.last() {
                    let index = last.index;
                    let size = crate::entry::ents_size(&m.entries);
                    self.applied_to(index, size);
                    self.reduce_uncommitted_size(payloads_size(&m.entries));
                }
            }

            MessageType::Vote | MessageType::PreVote => {
                // We can vote if this is a repeat of a vote we've already
                // cast, or we haven't voted and don't think there's a
                // leader yet in this term, or this is a pre-vote for a
                // future term.
                let can_vote = self.vote == m.from
                    || (self.vote == NONE && self.lead == NONE)
                    || (m.msg_type == MessageType::PreVote && m.term > self.term);
                let last = self.raft_log.last_entry_id();
                let cand_last = EntryId::new(m.log_term, m.index);
                if can_vote && self.raft_log.is_up_to_date(cand_last) {
                    // Learners cast votes too: a promoted learner may not
                    // have learned about its promotion, while the
                    // candidate's configuration already counts it.
                    tracing::info!(
                        "{} [logterm: {}, index: {}, vote: {}] cast {} for {} [logterm: {}, index: {}] at term {}",
                        self.id,
                        last.term,
                        last.index,
                        self.vote,
                        m.msg_type,
                        m.from,
                        cand_last.term,
                        cand_last.index,
                        self.term
                    );
                    // The response echoes the request term, not ours: a
                    // pre-vote does not move our term, and the candidate
                    // drops answers below the term it asked about.
                    self.send(Message {
                        msg_type: vote_resp_type(m.msg_type),
                        to: m.from,
                        term: m.term,
                        ..Default::default()
                    });
                    if m.msg_type == MessageType::Vote {
                        self.election_elapsed = 0;
                        self.vote = m.from;
                    }
                } else {
                    tracing::info!(
                        "{} [logterm: {}, index: {}, vote: {}] rejected {} from {} [logterm: {}, index: {}] at term {}",
                        self.id,
                        last.term,
                        last.index,
                        self.vote,
                        m.msg_type,
                        m.from,
                        cand_last.term,
                        cand_last.index,
                        self.term
                    );
                    self.send(Message {
                        msg_type: vote_resp_type(m.msg_type),
                        to: m.from,
                        term: self.term,
                        reject: true,
                        ..Default::default()
                    });
                }
            }

            _ => match self.state {
                StateRole::Leader => return self.step_leader(m),
                StateRole::Candidate | StateRole::PreCandidate => return self.step_candidate(m),
                StateRole::Follower => return self.step_follower(m),
            },
        }
        Ok(())
    }

    fn step_leader(&mut self, m: Message) -> Result<(), Error> {
        // Message types that do not need a progress for m.from.
        match m.msg_type {
            MessageType::Beat => {
                self.bcast_heartbeat();
                return Ok(());
            }
            MessageType::CheckQuorum => {
                if !self.tracker.quorum_active() {
                    tracing::warn!(
                        "{} stepped down to follower since quorum is not active",
                        self.id
                    );
                    // Keep ourselves as the remembered leader: the epoch
                    // exposed during our stint must not regress.
                    let (term, id) = (self.term, self.id);
                    self.become_follower(term, id);
                }
                // Everyone starts the next activity window inactive,
                // except ourselves.
                let id = self.id;
                self.tracker.visit(|pid, pr| {
                    if pid != id {
                        pr.recent_active = false;
                    }
                });
                return Ok(());
            }
            MessageType::Prop => {
                assert!(!m.entries.is_empty(), "{} stepped empty Prop", self.id);
                if self.tracker.progress(self.id).is_none() {
                    // We were removed from the configuration while
                    // serving as leader; do not accept new work.
                    return Err(Error::ProposalDropped);
                }
                if self.lead_transferee != NONE {
                    tracing::debug!(
                        "{} [term {}] transfer leadership to {} is in progress; dropping proposal",
                        self.id,
                        self.term,
                        self.lead_transferee
                    );
                    return Err(Error::ProposalDropped);
                }

                let mut entries = m.entries;
                for (i, e) in entries.iter_mut().enumerate() {
                    let cc = match &e.payload {
                        EntryPayload::ConfChange(cc) => Some(cc.as_v2()),
                        EntryPayload::ConfChangeV2(cc) => Some(cc.clone()),
                        EntryPayload::Normal(_) => None,
                    };
                    let Some(cc) = cc else { continue };

                    // The "one pending change" invariant: a new change
                    // may not be proposed until the previous one is
                    // applied on this leader.
                    let already_pending = self.pending_conf_index > self.raft_log.applied;
                    let already_joint = self.tracker.config.is_joint();
                    let wants_leave_joint = cc.leave_joint();

                    let mut failed_check = None;
                    if already_pending {
                        failed_check = Some(format!(
                            "possible unapplied conf change at index {} (applied to {})",
                            self.pending_conf_index, self.raft_log.applied
                        ));
                    } else if already_joint && !wants_leave_joint {
                        failed_check = Some("must transition out of joint config first".into());
                    } else if !already_joint && wants_leave_joint {
                        failed_check =
                            Some("not in joint state; refusing empty conf change".into());
                    }

                    // The pending-change check always holds; the others
                    // may be delegated to a layer above this core.
                    if already_pending
                        || (failed_check.is_some() && !self.disable_conf_change_validation)
                    {
                        tracing::info!(
                            "{} ignoring conf change {} at config {}: {}",
                            self.id,
                            cc,
                            self.tracker.config,
                            failed_check.unwrap_or_default()
                        );
                        // Keep the log slot: the change is disarmed, not
                        // dropped.
                        *e = Entry::new(0, 0, EntryPayload::default());
                    } else {
                        self.pending_conf_index = self.raft_log.last_index() + i as u64 + 1;
                    }
                }

                if !self.append_entry(entries) {
                    return Err(Error::ProposalDropped);
                }
                self.bcast_append();
                return Ok(());
            }
            MessageType::ForgetLeader => return Ok(()), // noop on leader
            _ => {}
        }

        // All other message types require a progress for m.from.
        if self.tracker.progress(m.from).is_none() {
            tracing::debug!("{} no progress available for {}", self.id, m.from);
            return Ok(());
        }
        match m.msg_type {
            MessageType::AppResp => self.handle_append_response(m),
            MessageType::HeartbeatResp => {
                let pr = self.tracker.progress_mut(m.from).expect("checked above");
                pr.recent_active = true;
                pr.msg_app_probes_paused = false;
                self.maybe_send_append(m.from);
            }
            MessageType::SnapStatus => {
                let pr = self.tracker.progress_mut(m.from).expect("checked above");
                if pr.state != ProgressState::Snapshot {
                    return Ok(());
                }
                if !m.reject {
                    pr.become_probe();
                    tracing::debug!(
                        "{} snapshot succeeded, resumed sending replication messages to {} [{}]",
                        self.id,
                        m.from,
                        pr
                    );
                } else {
                    // Clear the pending snapshot first: probing must not
                    // resume from an index the peer never received.
                    pr.pending_snapshot = 0;
                    pr.become_probe();
                    tracing::debug!(
                        "{} snapshot failed, resumed sending replication messages to {} [{}]",
                        self.id,
                        m.from,
                        pr
                    );
                }
                // On success, wait for the peer's append response before
                // sending more; on failure, wait out a heartbeat
                // interval.
                pr.msg_app_probes_paused = true;
            }
            MessageType::Unreachable => {
                let pr = self.tracker.progress_mut(m.from).expect("checked above");
                // An in-flight append to an unreachable peer is most
                // likely lost.
                if pr.state == ProgressState::Replicate {
                    pr.become_probe();
                }
                tracing::debug!(
                    "{} failed to send message to {} because it is unreachable [{}]",
                    self.id,
                    m.from,
                    pr
                );
            }
            MessageType::TransferLeader => self.handle_transfer_leader(m),
            _ => {}
        }
        Ok(())
    }

    fn handle_append_response(&mut self, m: Message) {
        // Also reached via the self-acknowledgment of local appends once
        // they are durable.
        let pr = self.tracker.progress_mut(m.from).expect("checked by caller");
        pr.recent_active = true;

        if m.reject {
            // The peer rejected the probe at m.index and hints at the
            // largest (index, term) at which our logs might agree. Use
            // our own log to skip whole terms of divergence in one step
            // instead of probing an index at a time.
            tracing::debug!(
                "{} received AppResp(rejected, hint: (index {}, term {})) from {} for index {}",
                self.id,
                m.reject_hint,
                m.log_term,
                m.from,
                m.index
            );
            let mut next_probe_index = m.reject_hint;
            if m.log_term > 0 {
                next_probe_index = self.raft_log.find_conflict_by_term(m.reject_hint, m.log_term).0;
            }
            let pr = self.tracker.progress_mut(m.from).expect("checked by caller");
            if pr.maybe_decr_to(m.index, next_probe_index) {
                tracing::debug!("{} decreased progress of {} to [{}]", self.id, m.from, pr);
                if pr.state == ProgressState::Replicate {
                    pr.become_probe();
                }
                self.maybe_send_append(m.from);
            }
            return;
        }

        // Accept. Also allow a probing peer whose match is already at
        // m.index back into replicate: the probe confirmed the prefix.
        let updated = pr.maybe_update(m.index)
            || (pr.matched == m.index && pr.state == ProgressState::Probe);
        if !updated {
            return;
        }
        match pr.state {
            ProgressState::Probe => pr.become_replicate(),
            ProgressState::Snapshot => {
                if pr.matched + 1 >= self.raft_log.first_index() {
                    // The follower can be caught up from the log no
                    // matter where its snapshot actually landed; go back
                    // through probe so the snapshot index is taken into
                    // account.
                    tracing::debug!(
                        "{} recovered from needing snapshot, resumed sending replication messages to {} [{}]",
                        self.id,
                        m.from,
                        pr
                    );
                    pr.become_probe();
                    pr.become_replicate();
                }
            }
            ProgressState::Replicate => {
                pr.inflights.free_le(m.index);
            }
        }

        if self.maybe_commit() {
            self.bcast_append();
        }
        // The freed window may fit several more appends.
        if self.id != m.from {
            while self.maybe_send_append(m.from) {}
        }
        // A caught-up transfer target may take over now.
        let matched = self.tracker.progress(m.from).map(|pr| pr.matched);
        if m.from == self.lead_transferee && matched == Some(self.raft_log.last_index()) {
            tracing::info!(
                "{} sent TimeoutNow to {} after received AppResp",
                self.id,
                m.from
            );
            self.send_timeout_now(m.from);
        }
    }

    fn handle_transfer_leader(&mut self, m: Message) {
        let pr = self.tracker.progress(m.from).expect("checked by caller");
        if pr.is_learner {
            tracing::debug!("{} is learner; ignored transferring leadership", m.from);
            return;
        }
        let transferee = m.from;
        if self.lead_transferee != NONE {
            if self.lead_transferee == transferee {
                tracing::info!(
                    "{} [term {}] transfer leadership to {} is in progress, ignores request to same node",
                    self.id,
                    self.term,
                    transferee
                );
                return;
            }
            let aborted = self.lead_transferee;
            self.abort_leader_transfer();
            tracing::info!(
                "{} [term {}] abort previous transferring leadership to {}",
                self.id,
                self.term,
                aborted
            );
        }
        if transferee == self.id {
            tracing::debug!(
                "{} is already leader; ignored transferring leadership to self",
                self.id
            );
            return;
        }
        tracing::info!(
            "{} [term {}] starts to transfer leadership to {}",
            self.id,
            self.term,
            transferee
        );
        // The handoff must finish within one election timeout.
        self.election_elapsed = 0;
        self.lead_transferee = transferee;
        if self.tracker.progress(transferee).map(|pr| pr.matched)
            == Some(self.raft_log.last_index())
        {
            self.send_timeout_now(transferee);
            tracing::info!(
                "{} sends TimeoutNow to {} immediately as it already has an up-to-date log",
                self.id,
                transferee
            );
        } else {
            self.tracker
                .progress_mut(transferee)
                .expect("checked by caller")
                .msg_app_probes_paused = false;
            self.maybe_send_append(transferee);
        }
    }

    fn step_candidate(&mut self, m: Message) -> Result<(), Error> {
        // While a candidate, stale PreVoteResp messages from our own
        // pre-candidacy may still arrive in this term; only the response
        // type matching the current campaign counts.
        let my_vote_resp_type = if self.state == StateRole::PreCandidate {
            MessageType::PreVoteResp
        } else {
            MessageType::VoteResp
        };
        match m.msg_type {
            MessageType::Prop => {
                tracing::info!("{} no leader at term {}; dropping proposal", self.id, self.term);
                return Err(Error::ProposalDropped);
            }
            MessageType::App => {
                self.become_follower(m.term, m.from); // always m.term == self.term
                self.handle_append_entries(m);
            }
            MessageType::Heartbeat => {
                self.become_follower(m.term, m.from); // always m.term == self.term
                self.handle_heartbeat(m);
            }
            MessageType::Snap => {
                self.become_follower(m.term, m.from); // always m.term == self.term
                self.handle_snapshot(m);
            }
            MessageType::TimeoutNow => {
                tracing::debug!(
                    "{} [term {} state {}] ignored TimeoutNow from {}",
                    self.id,
                    self.term,
                    self.state,
                    m.from
                );
            }
            t if t == my_vote_resp_type => {
                let (granted, rejected, res) = self.poll(m.from, m.msg_type, !m.reject);
                tracing::info!(
                    "{} has received {} {} votes and {} vote rejections",
                    self.id,
                    granted,
                    m.msg_type,
                    rejected
                );
                match res {
                    VoteResult::Won => {
                        if self.state == StateRole::PreCandidate {
                            self.campaign(CampaignType::Election);
                        } else {
                            self.become_leader();
                            self.bcast_append();
                        }
                    }
                    VoteResult::Lost => {
                        // A PreVoteResp carries the future term of the
                        // pre-candidate; stay at our current term.
                        let (term, lead) = (self.term, self.lead);
                        self.become_follower(term, lead);
                    }
                    VoteResult::Pending => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn step_follower(&mut self, m: Message) -> Result<(), Error> {
        match m.msg_type {
            MessageType::Prop => {
                if self.lead == NONE {
                    tracing::info!("{} no leader at term {}; dropping proposal", self.id, self.term);
                    return Err(Error::ProposalDropped);
                } else if self.disable_proposal_forwarding {
                    tracing::info!(
                        "{} not forwarding to leader {} at term {}; dropping proposal",
                        self.id,
                        self.lead,
                        self.term
                    );
                    return Err(Error::ProposalDropped);
                } else if self.lead == self.id {
                    tracing::info!(
                        "{} not forwarding to itself at term {}; dropping proposal",
                        self.id,
                        self.term
                    );
                    return Err(Error::ProposalDropped);
                }
                let mut m = m;
                m.to = self.lead;
                self.send(m);
            }
            MessageType::App => {
                self.election_elapsed = 0;
                self.assign_lead(m.from);
                self.handle_append_entries(m);
            }
            MessageType::Heartbeat => {
                self.election_elapsed = 0;
                self.assign_lead(m.from);
                self.handle_heartbeat(m);
            }
            MessageType::Snap => {
                self.election_elapsed = 0;
                self.assign_lead(m.from);
                self.handle_snapshot(m);
            }
            MessageType::TransferLeader => {
                if self.lead == NONE {
                    tracing::info!(
                        "{} no leader at term {}; dropping leader transfer msg",
                        self.id,
                        self.term
                    );
                    return Ok(());
                } else if self.lead == self.id {
                    tracing::info!(
                        "{} is itself the leader at term {}; dropping leader transfer msg",
                        self.id,
                        self.term
                    );
                    return Ok(());
                }
                let mut m = m;
                m.to = self.lead;
                self.send(m);
            }
            MessageType::ForgetLeader => {
                if self.lead != NONE {
                    tracing::info!("{} forgetting leader {} at term {}", self.id, self.lead, self.term);
                    self.lead = NONE;
                }
            }
            MessageType::TimeoutNow => {
                tracing::info!(
                    "{} [term {}] received TimeoutNow from {} and starts an election to get leadership",
                    self.id,
                    self.term,
                    m.from
                );
                // A handoff never pre-votes: we are not recovering from a
                // partition, so the extra round trip buys nothing.
                self.hup(CampaignType::Transfer);
            }
            _ => {}
        }
        Ok(())
    }

    /// Adopts `from` as the leader of the current term. Within one term
    /// the leader is unique, so an already-known leader must agree.
    fn assign_lead(&mut self, from: PeerId) {
        debug_assert!(
            self.lead == NONE || self.lead == from,
            "leader changed from {} to {} within term {}",
            self.lead,
            from,
            self.term
        );
        self.lead = from;
    }

    /// Validates that the leader's idea of our matched prefix does not
    /// exceed our log: if it does, the log was corrupted or lost.
    fn check_match(&self, matched: u64) {
        let last = self.raft_log.last_index();
        assert!(
            last >= matched,
            "match({}) is out of range [last index {}]. Was the raft log corrupted, truncated, or lost?",
            matched,
            last
        );
    }

    fn handle_append_entries(&mut self, m: Message) {
        self.check_match(m.matched);

        let slice = LogSlice::from_append(&m);
        if let Err(e) = slice.valid() {
            tracing::error!("{} received an invalid append: {}", self.id, e);
            return;
        }

        if slice.prev.index < self.raft_log.committed {
            // The append is entirely behind our commit; answer with where
            // we actually are.
            self.send(Message {
                msg_type: MessageType::AppResp,
                to: m.from,
                index: self.raft_log.committed,
                ..Default::default()
            });
            return;
        }

        let last_index = slice.last_index();
        if self.raft_log.maybe_append(slice) {
            self.raft_log
                .commit_to(LogMark::new(m.term, m.commit.min(last_index)));
            self.send(Message {
                msg_type: MessageType::AppResp,
                to: m.from,
                index: last_index,
                ..Default::default()
            });
            return;
        }

        tracing::debug!(
            "{} [logterm: {}, index: {}] rejected App [logterm: {}, index: {}] from {}",
            self.id,
            self.raft_log.zero_term_on_out_of_bounds(m.index),
            m.index,
            m.log_term,
            m.index,
            m.from
        );

        // Our log does not match at m.index. Hint at the largest
        // (index, term) at which the logs might agree: the largest index
        // with a term not above the append's log term. This skips our
        // whole uncommitted tail of higher-term entries in one response.
        let hint_index = m.index.min(self.raft_log.last_index());
        let (hint_index, hint_term) = self.raft_log.find_conflict_by_term(hint_index, m.log_term);
        self.send(Message {
            msg_type: MessageType::AppResp,
            to: m.from,
            index: m.index,
            reject: true,
            reject_hint: hint_index,
            log_term: hint_term,
            ..Default::default()
        });
    }

    fn handle_heartbeat(&mut self, m: Message) {
        self.check_match(m.matched);

        // The commit mark is stamped with the leader's term; commit_to
        // applies it only if our log is known to be a prefix of that
        // leader's log (accepted term equality). Otherwise our commit
        // index converges once we accept an append from this leader.
        let mark = LogMark::new(m.term, m.commit.min(self.raft_log.last_index()));
        self.raft_log.commit_to(mark);
        self.send(Message {
            msg_type: MessageType::HeartbeatResp,
            to: m.from,
            ..Default::default()
        });
    }

    fn handle_snapshot(&mut self, m: Message) {
        let snapshot = m.snapshot.clone().unwrap_or_default();
        let id = EntryId::new(snapshot.meta.term, snapshot.meta.index);
        if self.restore(m.term, snapshot) {
            tracing::info!(
                "{} [commit: {}] restored snapshot [index: {}, term: {}]",
                self.id,
                self.raft_log.committed,
                id.index,
                id.term
            );
            self.send(Message {
                msg_type: MessageType::AppResp,
                to: m.from,
                index: self.raft_log.last_index(),
                ..Default::default()
            });
        } else {
            tracing::info!(
                "{} [commit: {}] ignored snapshot [index: {}, term: {}]",
                self.id,
                self.raft_log.committed,
                id.index,
                id.term
            );
            self.send(Message {
                msg_type: MessageType::AppResp,
                to: m.from,
                index: self.raft_log.committed,
                ..Default::default()
            });
        }
    }

    /// Installs a snapshot received from the `term` leader: the log and
    /// the configuration are replaced by what the snapshot declares.
    /// Returns false iff the snapshot was ignored.
    fn restore(&mut self, term: u64, snapshot: Snapshot) -> bool {
        let id = EntryId::new(snapshot.meta.term, snapshot.meta.index);
        if id.index <= self.raft_log.committed {
            return false;
        }
        assert!(
            self.state == StateRole::Follower,
            "{} attempted to restore snapshot in state {}",
            self.id,
            self.state
        );

        // A snapshot that does not know about us must not wipe our log;
        // plenty of code assumes the local id is always tracked.
        if !snapshot.meta.conf_state.contains(self.id) {
            tracing::warn!(
                "{} attempted to restore snapshot but it is not in the conf state {:?}; should never happen",
                self.id,
                snapshot.meta.conf_state
            );
            return false;
        }

        if self.raft_log.match_term(id) {
            // Our log already covers the snapshot, and matching at its
            // last id makes the whole prefix identical to the committed
            // prefix it declares. Fast-forward the commit index and keep
            // the log.
            let last = self.raft_log.last_entry_id();
            tracing::info!(
                "{} [commit: {}, lastindex: {}, lastterm: {}] fast-forwarded commit to snapshot [index: {}, term: {}]",
                self.id,
                self.raft_log.committed,
                last.index,
                last.term,
                id.index,
                id.term
            );
            let acc_term = self.raft_log.acc_term();
            self.raft_log.commit_to(LogMark::new(acc_term, id.index));
            return false;
        }

        let conf_state = snapshot.meta.conf_state.clone();
        self.raft_log.restore(term, snapshot);

        let changer = Changer {
            config: Default::default(),
            progress: Default::default(),
            max_inflight_msgs: self.max_inflight_msgs,
            max_inflight_bytes: self.max_inflight_bytes,
            last_index: self.raft_log.last_index(),
        };
        let (cfg, progress) = changer
            .restore(&conf_state)
            .unwrap_or_else(|e| panic!("unable to restore config {:?}: {}", conf_state, e));
        let restored = self.switch_to_config(cfg, progress);
        assert!(
            conf_state.equivalent(&restored),
            "restored conf state {:?} differs from snapshot {:?}",
            restored,
            conf_state
        );

        let last = self.raft_log.last_entry_id();
        tracing::info!(
            "{} [commit: {}, lastindex: {}, lastterm: {}] restored snapshot [index: {}, term: {}]",
            self.id,
            self.raft_log.committed,
            last.index,
            last.term,
            id.index,
            id.term
        );
        true
    }

    // --- configuration changes ---

    /// Applies a committed configuration change and returns the
    /// resulting membership. The host calls this while applying a
    /// conf-change entry.
    pub fn apply_conf_change(&mut self, cc: &ConfChangeV2) -> ConfState {
        let changer = Changer {
            config: self.tracker.config.clone(),
            progress: self.tracker.take_progress(),
            max_inflight_msgs: self.max_inflight_msgs,
            max_inflight_bytes: self.max_inflight_bytes,
            last_index: self.raft_log.last_index(),
        };
        let res = if cc.leave_joint() {
            changer.leave_joint()
        } else if let Some(auto_leave) = cc.enter_joint() {
            changer.enter_joint(auto_leave, &cc.changes)
        } else {
            changer.simple(&cc.changes)
        };
        // An invalid committed change means the validation above us was
        // bypassed or broken; applying it would corrupt the group.
        let (config, progress) = res.unwrap_or_else(|e| panic!("applying conf change: {}", e));
        self.switch_to_config(config, progress)
    }

    /// Adopts the given configuration and progress, reacting to our own
    /// removal or demotion and to changed quorum requirements.
    fn switch_to_config(&mut self, config: QuorumConfig, progress: ProgressMap) -> ConfState {
        self.tracker = ProgressTracker::new(config, progress);
        tracing::info!("{} switched to configuration {}", self.id, self.tracker.config);

        let conf_state = self.tracker.config.to_conf_state();
        let pr = self.tracker.progress(self.id);
        let exists = pr.is_some();
        self.is_learner = pr.map_or(false, |pr| pr.is_learner);

        if (!exists || self.is_learner) && self.state == StateRole::Leader {
            // This leader was removed or demoted. Step down if the host
            // asked for it; remember our own stint so the exposed epoch
            // does not regress.
            if self.step_down_on_removal {
                let (term, lead) = (self.term, self.lead);
                self.become_follower(term, lead);
            }
            return conf_state;
        }

        // The remaining steps only make sense on a leader with peers.
        if self.state != StateRole::Leader || conf_state.voters.is_empty() {
            return conf_state;
        }

        // The changed quorum may commit more entries now; in any case,
        // probe newly added replicas without waiting for a heartbeat.
        self.maybe_commit();
        self.bcast_append();

        if self.lead_transferee != NONE && !self.tracker.config.voters.contains(self.lead_transferee)
        {
            self.abort_leader_transfer();
        }

        conf_state
    }

    // --- timers and quotas ---

    fn past_election_timeout(&self) -> bool {
        self.election_elapsed >= self.randomized_election_timeout
    }

    fn reset_randomized_election_timeout(&mut self) {
        self.randomized_election_timeout =
            self.election_timeout + self.rng.next_u64() % self.election_timeout;
    }

    /// Pins the election timeout, for deterministic tests.
    #[doc(hidden)]
    pub fn set_randomized_election_timeout(&mut self, timeout: u64) {
        self.randomized_election_timeout = timeout;
    }

    fn send_timeout_now(&mut self, to: PeerId) {
        self.send(Message::new(MessageType::TimeoutNow, to, NONE));
    }

    fn abort_leader_transfer(&mut self) {
        self.lead_transferee = NONE;
    }

    /// Accounts proposed payload bytes against the uncommitted-tail
    /// quota. An empty payload is never refused, so a new leader's blank
    /// entry and the auto-leave change always go through.
    fn increase_uncommitted_size(&mut self, entries: &[Entry]) -> bool {
        let size = payloads_size(entries);
        if self.uncommitted_size > 0
            && size > 0
            && self.uncommitted_size + size > self.max_uncommitted_size
        {
            return false;
        }
        self.uncommitted_size += size;
        true
    }

    pub(crate) fn reduce_uncommitted_size(&mut self, size: u64) {
        // The tracked size may underestimate (never overestimate) the
        // uncommitted tail; saturate instead of underflowing.
        self.uncommitted_size = self.uncommitted_size.saturating_sub(size);
    }
}
