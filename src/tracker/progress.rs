use std::fmt;

use crate::tracker::Inflights;

/// The replication mode of one follower, as seen by the leader.
#[derive(Clone, Copy, Debug, Default)]
#[derive(PartialEq, Eq)]
pub enum ProgressState {
    /// At most one outstanding append probe; used while the match index
    /// is unknown or after a rejection.
    #[default]
    Probe,
    /// Pipelined appends, bounded by the in-flight window.
    Replicate,
    /// A snapshot is being streamed; appends are suppressed until it is
    /// reported applied or failed.
    Snapshot,
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProgressState::Probe => "StateProbe",
            ProgressState::Replicate => "StateReplicate",
            ProgressState::Snapshot => "StateSnapshot",
        };
        write!(f, "{}", name)
    }
}

/// The leader's view of one peer's log.
#[derive(Clone, Debug)]
#[derive(PartialEq, Eq)]
pub struct Progress {
    /// The highest index known to be replicated on the peer.
    pub matched: u64,
    /// The next index to send.
    pub next: u64,

    pub state: ProgressState,

    /// The index of the snapshot being streamed, if `state` is
    /// `Snapshot`. Retained so that a probe after the snapshot resumes
    /// past it rather than from `matched + 1`.
    pub pending_snapshot: u64,

    /// Set when any message arrives from the peer; cleared at each
    /// CheckQuorum cycle.
    pub recent_active: bool,

    /// In `Probe`, set once a probe is in flight (or after a failed
    /// snapshot) to suppress further probes until a response or
    /// heartbeat interval.
    pub msg_app_probes_paused: bool,

    /// The highest commit index sent to the peer. Lets the leader send
    /// an otherwise-empty append when only the commit index moved.
    pub(crate) sent_commit: u64,

    pub(crate) inflights: Inflights,

    pub is_learner: bool,
}

impl Progress {
    pub(crate) fn new(next: u64, max_inflight_msgs: u64, max_inflight_bytes: u64) -> Self {
        Self {
            matched: 0,
            next,
            state: ProgressState::default(),
            pending_snapshot: 0,
            recent_active: false,
            msg_app_probes_paused: false,
            sent_commit: 0,
            inflights: Inflights::new(max_inflight_msgs, max_inflight_bytes),
            is_learner: false,
        }
    }

    fn reset_state(&mut self, state: ProgressState) {
        self.msg_app_probes_paused = false;
        self.pending_snapshot = 0;
        self.state = state;
        self.inflights.reset();
    }

    /// Transitions into `Probe`. Coming out of `Snapshot`, probing
    /// resumes optimistically from the snapshot index.
    pub(crate) fn become_probe(&mut self) {
        if self.state == ProgressState::Snapshot {
            let pending = self.pending_snapshot;
            self.reset_state(ProgressState::Probe);
            self.next = (self.matched + 1).max(pending + 1);
        } else {
            self.reset_state(ProgressState::Probe);
            self.next = self.matched + 1;
        }
    }

    pub(crate) fn become_replicate(&mut self) {
        self.reset_state(ProgressState::Replicate);
        self.next = self.matched + 1;
    }

    pub(crate) fn become_snapshot(&mut self, snapshot_index: u64) {
        self.reset_state(ProgressState::Snapshot);
        self.pending_snapshot = snapshot_index;
    }

    /// Updates the view on a successful append response for index `n`.
    /// Returns true iff the match index advanced.
    pub(crate) fn maybe_update(&mut self, n: u64) -> bool {
        let updated = self.matched < n;
        if updated {
            self.matched = n;
            self.msg_app_probes_paused = false;
        }
        self.next = self.next.max(n + 1);
        updated
    }

    /// Updates the view on a rejected append response. `rejected` is the
    /// probed index, `match_hint` the peer's suggestion of where the
    /// logs might still agree. Returns false iff the rejection is stale.
    pub(crate) fn maybe_decr_to(&mut self, rejected: u64, match_hint: u64) -> bool {
        if self.state == ProgressState::Replicate {
            // The rejection must be stale if the progress has matched and
            // `rejected` is smaller than "match".
            if rejected <= self.matched {
                return false;
            }
            self.next = self.matched + 1;
            return true;
        }

        // The rejection must be stale if `rejected` does not match the
        // index of the one outstanding probe.
        if self.next - 1 != rejected {
            return false;
        }

        self.next = rejected.min(match_hint + 1).max(self.matched + 1);
        self.msg_app_probes_paused = false;
        true
    }

    /// True if entries starting at `next` may be attached to an append.
    pub(crate) fn can_send_entries(&self, last_index: u64) -> bool {
        match self.state {
            ProgressState::Probe => self.next <= last_index,
            ProgressState::Replicate => self.next <= last_index && !self.inflights.full(),
            ProgressState::Snapshot => false,
        }
    }

    /// Whether an append (possibly empty) should be sent now, given the
    /// leader's last index and commit index.
    pub(crate) fn should_send_msg_app(&self, last_index: u64, commit: u64) -> bool {
        match self.state {
            ProgressState::Probe => {
                // One probe at a time, but a commit advancement is worth
                // an extra (empty) append.
                !self.msg_app_probes_paused || self.sent_commit < commit
            }
            ProgressState::Replicate => {
                if self.can_send_entries(last_index) {
                    return true;
                }
                // Everything is sent; nudge the peer's commit index if
                // ours moved past what it has seen, but never announce a
                // commit beyond what was sent to it.
                self.sent_commit < commit.min(self.next - 1)
            }
            ProgressState::Snapshot => false,
        }
    }

    /// Accounts for an append of `entries` entries totalling `bytes`
    /// payload bytes having been sent.
    pub(crate) fn sent_entries(&mut self, entries: usize, bytes: u64) {
        match self.state {
            ProgressState::Replicate => {
                if entries > 0 {
                    self.next += entries as u64;
                    self.inflights.add(self.next - 1, bytes);
                }
            }
            ProgressState::Probe => {
                if entries > 0 {
                    self.msg_app_probes_paused = true;
                }
            }
            ProgressState::Snapshot => {
                panic!("sending append in snapshot state");
            }
        }
    }

    /// Accounts for a commit index having been announced to the peer.
    pub(crate) fn sent_commit(&mut self, commit: u64) {
        if commit > self.sent_commit {
            self.sent_commit = commit;
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} match={} next={}", self.state, self.matched, self.next)?;
        if self.is_learner {
            write!(f, " learner")?;
        }
        if self.state == ProgressState::Snapshot {
            write!(f, " pendingSnap={}", self.pending_snapshot)?;
        }
        if self.msg_app_probes_paused {
            write!(f, " paused")?;
        }
        if self.inflights.count() > 0 {
            write!(f, " inflight={}", self.inflights.count())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn progress(next: u64) -> Progress {
        Progress::new(next, 256, u64::MAX)
    }

    #[test]
    fn test_maybe_update() {
        let mut pr = progress(6);
        pr.matched = 5;

        assert!(!pr.maybe_update(4), "stale ack must not regress");
        assert_eq!(5, pr.matched);

        assert!(pr.maybe_update(7));
        assert_eq!(7, pr.matched);
        assert_eq!(8, pr.next);
    }

    #[test]
    fn test_maybe_decr_to_probe_state() {
        let mut pr = progress(10);
        pr.matched = 2;

        // A rejection not matching the outstanding probe is stale.
        assert!(!pr.maybe_decr_to(7, 6));
        assert_eq!(10, pr.next);

        // Hint moves next directly to the hinted index + 1.
        assert!(pr.maybe_decr_to(9, 5));
        assert_eq!(6, pr.next);

        // Next never drops below matched + 1.
        pr.next = 4;
        assert!(pr.maybe_decr_to(3, 0));
        assert_eq!(3, pr.next);
    }

    #[test]
    fn test_maybe_decr_to_replicate_state() {
        let mut pr = progress(10);
        pr.become_replicate();
        pr.matched = 5;
        pr.next = 10;

        assert!(!pr.maybe_decr_to(5, 0), "rejection below match is stale");
        assert!(pr.maybe_decr_to(9, 0));
        assert_eq!(6, pr.next);
    }

    #[test]
    fn test_become_probe_after_snapshot_resumes_past_it() {
        let mut pr = progress(3);
        pr.matched = 2;
        pr.become_snapshot(20);
        pr.become_probe();
        assert_eq!(21, pr.next);
        assert_eq!(0, pr.pending_snapshot);
    }

    #[test]
    fn test_should_send_msg_app_probe() {
        let mut pr = progress(6);
        pr.matched = 5;
        assert!(pr.should_send_msg_app(10, 3));

        pr.sent_entries(1, 100);
        pr.sent_commit(3);
        assert!(pr.msg_app_probes_paused);
        assert!(!pr.should_send_msg_app(10, 3));

        // A commit advancement is worth an extra append.
        assert!(pr.should_send_msg_app(10, 4));
    }

    #[test]
    fn test_should_send_msg_app_replicate() {
        let mut pr = progress(6);
        pr.matched = 5;
        pr.become_replicate();

        // Entries pending: send.
        assert!(pr.should_send_msg_app(10, 0));

        // Fully caught up, commit already announced: nothing to send.
        pr.sent_entries(4, 400);
        pr.sent_commit(8);
        assert!(!pr.should_send_msg_app(9, 8));

        // Commit moved: send an empty append, but only up to what the
        // peer was sent.
        assert!(pr.should_send_msg_app(9, 9));
    }

    #[test]
    fn test_should_send_msg_app_snapshot() {
        let mut pr = progress(6);
        pr.become_snapshot(10);
        assert!(!pr.should_send_msg_app(20, 20));
    }

    #[test]
    fn test_sent_entries_replicate_tracks_inflights() {
        let mut pr = progress(6);
        pr.matched = 5;
        pr.become_replicate();

        pr.sent_entries(3, 300);
        assert_eq!(9, pr.next);
        assert_eq!(1, pr.inflights.count());
    }
}
