use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::future::pending;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{ComplexConfig, Config};
use crate::error::{RaftError, RaftResult};
use crate::invariants;
use crate::log::{EntryPayload, LogEntry, LogSlice};
use crate::persistence::{PersistentState, Storage};
use crate::rpc::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    Network, RequestVoteReply, RequestVoteRequest,
};
use crate::state_machine::StateMachine;
use crate::sync::{Cancel, CancelSource, TaskGuard};
use crate::types::{Index, MemberId, Term};

// Parameters controlling the timing behavior of a member. The defaults are
// tuned for real deployments; tests shrink them to keep runtimes short.
#[derive(Clone, Debug)]
pub struct Options {
    // Bounds for the randomized election timeout, redrawn every time the
    // election timer is rearmed (Raft paper, Section 5.6).
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,

    // How often a leader contacts each follower, and the granularity at
    // which the watchdog evaluates the election timeout. Must be well below
    // the election timeout.
    pub heartbeat_interval: Duration,

    // Timeout for a single outbound RPC.
    pub rpc_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_millis(500),
            rpc_timeout: Duration::from_millis(100),
        }
    }
}

// The role a member currently plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Follower,
    Candidate,
    Leader,
}

// A point-in-time view of a member, for observability and tests.
#[derive(Clone, Debug)]
pub struct MemberStatus {
    pub id: MemberId,
    pub term: Term,
    pub mode: Mode,
    pub leader: MemberId,
    pub commit_index: Index,
    pub last_applied: Index,
    pub log_prev_index: Index,
    pub latest_log_index: Index,
    pub initialized: bool,
}

// What a leader knows about one peer, as in Figure 2 of the Raft paper.
#[derive(Clone, Debug)]
pub(crate) struct PeerProgress {
    // Index of the next log entry to send to the peer.
    pub(crate) next_index: Index,

    // Highest index known to be replicated on the peer.
    pub(crate) match_index: Index,
}

// The outcome of one candidacy, reported at the await sites of the
// candidate activity.
#[derive(Debug, PartialEq)]
enum ElectionOutcome {
    Elected,
    HigherTerm,
    Timeout,
    Cancelled,
}

// All mutable state of a member. A single mutex serializes access: every
// inbound RPC handler, every proposal, and the candidate-and-leader
// activity acquire it before touching anything, and the exclusive borrow it
// yields is the only path to the log, the snapshot, and the applied state.
pub(crate) struct MemberInner<S: StateMachine> {
    pub(crate) id: MemberId,
    pub(crate) options: Options,
    pub(crate) storage: Arc<dyn Storage<S>>,
    pub(crate) network: Arc<dyn Network<S>>,

    // Everything that must survive a restart.
    pub(crate) ps: PersistentState<S>,

    // The applied state. Meaningless until a snapshot has been received (or
    // the member was created with `make_initial`); `initialized_watch`
    // tracks which of the two it is.
    pub(crate) state_machine: S,
    pub(crate) commit_index: Index,
    pub(crate) last_applied: Index,

    pub(crate) mode: Mode,

    // The leader we have acknowledged this term, or nil.
    pub(crate) current_term_leader_id: MemberId,

    // Election timer: the watchdog compares the elapsed time against the
    // randomized timeout drawn at the last rearm.
    last_heard_from_leader: Instant,
    election_timeout: Duration,

    // Per-peer replication state. Only meaningful while leader.
    pub(crate) peers: HashMap<MemberId, PeerProgress>,

    // Pulsed whenever the log grows or the commit index moves, to wake
    // replicators waiting for something to send.
    update_notify: Arc<Notify>,

    watchdog: Option<TaskGuard>,

    leader_watch: watch::Sender<MemberId>,
    state_watch: watch::Sender<S>,
    initialized_watch: watch::Sender<bool>,
}

impl<S: StateMachine> MemberInner<S> {
    pub(crate) fn is_initialized(&self) -> bool {
        self.ps.snapshot_state.is_some()
    }

    // Returns the configuration used for quorum decisions together with the
    // log index that established it. Configurations take effect as soon as
    // they are appended, so this is the latest configuration entry anywhere
    // in the log, falling back to the snapshot configuration.
    pub(crate) fn effective_config_entry(&self) -> (Index, ComplexConfig) {
        match self.ps.log.latest_config() {
            Some((index, config)) => (index, config.clone()),
            None => (
                self.ps.log.prev_index,
                self.ps
                    .snapshot_config
                    .clone()
                    .expect("member knows a configuration"),
            ),
        }
    }

    pub(crate) fn effective_config(&self) -> ComplexConfig {
        self.effective_config_entry().1
    }

    // The latest configuration known to be committed.
    pub(crate) fn committed_config(&self) -> ComplexConfig {
        match self.ps.log.config_at_or_below(self.commit_index) {
            Some((_, config)) => config.clone(),
            None => self
                .ps
                .snapshot_config
                .clone()
                .expect("member knows a configuration"),
        }
    }

    fn rearm_election_timer(&mut self) {
        self.last_heard_from_leader = Instant::now();
        let min = self.options.election_timeout_min.as_millis() as u64;
        let max = self.options.election_timeout_max.as_millis() as u64;
        self.election_timeout = Duration::from_millis(rand::thread_rng().gen_range(min..=max));
    }

    fn election_timer_elapsed(&self) -> bool {
        self.last_heard_from_leader.elapsed() >= self.election_timeout
    }

    fn set_leader(&mut self, leader: MemberId) {
        self.current_term_leader_id = leader;
        self.leader_watch.send_if_modified(|current| {
            if *current != leader {
                *current = leader;
                true
            } else {
                false
            }
        });
    }

    // Adopts a higher term, clearing all per-term state. Callers decide
    // whether a step-down goes with it and when to persist.
    fn update_term(&mut self, new_term: Term) {
        assert!(new_term > self.ps.current_term, "terms must increase");
        self.ps.current_term = new_term;
        self.ps.voted_for = None;
        self.set_leader(MemberId::nil());
    }

    fn to_follower(&mut self) {
        self.mode = Mode::Follower;
        self.peers.clear();
    }

    fn step_down(&mut self) {
        self.to_follower();
        self.rearm_election_timer();
    }

    async fn persist(&self, cancel: &Cancel) -> RaftResult<()> {
        self.storage.write_persistent_state(&self.ps, cancel).await
    }

    // Moves the commit index forward and applies the newly committed
    // entries, in index order, exactly once.
    fn update_commit_index(&mut self, new_commit: Index) {
        assert!(
            new_commit >= self.commit_index,
            "commit index must not decrease"
        );
        assert!(new_commit <= self.ps.log.latest_index());
        if new_commit == self.commit_index {
            return;
        }
        debug!(member = %self.id, from = self.commit_index, to = new_commit, "advancing commit index");
        self.commit_index = new_commit;
        self.apply_committed();
        self.update_notify.notify_waiters();
    }

    fn apply_committed(&mut self) {
        if !self.is_initialized() {
            // Without a snapshot there is no base state to apply changes to;
            // the commit index may still advance and application catches up
            // once the first snapshot arrives.
            return;
        }
        let mut changed = false;
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = self.ps.log.entry_at(self.last_applied);
            if let EntryPayload::Regular(change) = &entry.payload {
                self.state_machine.apply_change(change);
                changed = true;
            }
        }
        if changed {
            self.state_watch.send_replace(self.state_machine.clone());
        }
    }

    pub(crate) fn check_invariants(&self) {
        invariants::check_member(self);
    }
}

// One member of a Raft cluster. It is constructed from a persistent-state
// value, talks to its peers through the `Network` collaborator, writes
// through the `Storage` collaborator, and hands committed changes to the
// state machine it manages.
//
// Dropping (or stopping) the member cancels all of its activities. A
// cancelled operation leaves the member in an undefined internal state, so
// a stopped member must not be reused; reconstruct it from storage instead.
pub struct Member<S: StateMachine> {
    id: MemberId,
    inner: Arc<Mutex<MemberInner<S>>>,
    cancel_source: CancelSource,
    leader_rx: watch::Receiver<MemberId>,
    state_rx: watch::Receiver<S>,
    initialized_rx: watch::Receiver<bool>,
}

impl<S: StateMachine> Member<S> {
    pub fn new(
        id: MemberId,
        storage: Arc<dyn Storage<S>>,
        network: Arc<dyn Network<S>>,
        persistent_state: PersistentState<S>,
        options: Options,
    ) -> RaftResult<Self> {
        persistent_state.validate()?;

        let initialized = persistent_state.snapshot_state.is_some();
        let state_machine = persistent_state
            .snapshot_state
            .clone()
            .unwrap_or_default();

        let (leader_tx, leader_rx) = watch::channel(MemberId::nil());
        let (state_tx, state_rx) = watch::channel(state_machine.clone());
        let (initialized_tx, initialized_rx) = watch::channel(initialized);

        // Everything covered by the snapshot is committed by definition.
        let commit_index = persistent_state.log.prev_index;

        let mut inner = MemberInner {
            id,
            options,
            storage,
            network,
            ps: persistent_state,
            state_machine,
            commit_index,
            last_applied: commit_index,
            mode: Mode::Follower,
            current_term_leader_id: MemberId::nil(),
            last_heard_from_leader: Instant::now(),
            election_timeout: Duration::ZERO,
            peers: HashMap::new(),
            update_notify: Arc::new(Notify::new()),
            watchdog: None,
            leader_watch: leader_tx,
            state_watch: state_tx,
            initialized_watch: initialized_tx,
        };
        inner.rearm_election_timer();
        inner.check_invariants();

        Ok(Member {
            id,
            inner: Arc::new(Mutex::new(inner)),
            cancel_source: CancelSource::new(),
            leader_rx,
            state_rx,
            initialized_rx,
        })
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    // Starts the watchdog. Until this is called the member answers RPCs but
    // never stands for election.
    pub async fn start(&self) {
        let mut guard = self.inner.lock().await;
        if guard.watchdog.is_some() {
            return;
        }
        debug!(member = %guard.id, term = guard.ps.current_term, "starting");
        let inner = self.inner.clone();
        let cancel = self.cancel_source.signal();
        let handle = tokio::spawn(Self::watchdog_loop(inner, cancel));
        guard.watchdog = Some(TaskGuard::new("watchdog", handle));
    }

    // Cancels every activity of this member. Operations already in flight
    // fail with `Cancelled`; the member must not be used afterwards.
    pub async fn stop(&self) {
        self.cancel_source.cancel();
        let mut guard = self.inner.lock().await;
        guard.watchdog = None;
    }

    // Returns the member believed to be the leader this term, or nil if no
    // leader is known.
    pub fn leader(&self) -> MemberId {
        *self.leader_rx.borrow()
    }

    pub fn observe_leader(&self) -> watch::Receiver<MemberId> {
        self.leader_rx.clone()
    }

    // Tracks the applied state. The value is meaningless until the
    // initialized signal fires.
    pub fn observe_state_machine(&self) -> watch::Receiver<S> {
        self.state_rx.clone()
    }

    // Fires once the member has a valid state: immediately for members made
    // with `make_initial`, at the first snapshot for members that joined.
    pub fn observe_initialized(&self) -> watch::Receiver<bool> {
        self.initialized_rx.clone()
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized_rx.borrow()
    }

    pub async fn status(&self) -> MemberStatus {
        let guard = self.inner.lock().await;
        MemberStatus {
            id: guard.id,
            term: guard.ps.current_term,
            mode: guard.mode,
            leader: guard.current_term_leader_id,
            commit_index: guard.commit_index,
            last_applied: guard.last_applied,
            log_prev_index: guard.ps.log.prev_index,
            latest_log_index: guard.ps.log.latest_index(),
            initialized: guard.is_initialized(),
        }
    }

    // Tries to replicate the given change. Success means the change was
    // appended and is being replicated; it has not necessarily been
    // committed yet and may never be. Callers that need to know the outcome
    // should watch the state machine.
    pub async fn propose_change(&self, change: S::Change, cancel: &Cancel) -> RaftResult<Index> {
        let mut guard = self.inner.lock().await;
        guard.check_invariants();
        if guard.mode != Mode::Leader {
            return Err(RaftError::NotLeader);
        }
        let entry = LogEntry {
            term: guard.ps.current_term,
            payload: EntryPayload::Regular(change),
        };
        let index = Self::leader_append_entry(&mut guard, entry, cancel).await?;
        Self::leader_sync(&mut guard, cancel).await?;
        guard.check_invariants();
        Ok(index)
    }

    // Tries to start a two-phase membership change towards the given
    // configuration. Fails fast if an earlier change has not completed.
    pub async fn propose_config_change(
        &self,
        new_config: Config,
        cancel: &Cancel,
    ) -> RaftResult<Index> {
        let mut guard = self.inner.lock().await;
        guard.check_invariants();
        if guard.mode != Mode::Leader {
            return Err(RaftError::NotLeader);
        }
        let (_, current) = guard.effective_config_entry();
        if current.is_joint_consensus() {
            return Err(RaftError::ConfigChangeInProgress);
        }
        info!(member = %guard.id, term = guard.ps.current_term, "starting joint consensus");
        let joint = ComplexConfig::joint(current.config.clone(), new_config);
        let entry = LogEntry {
            term: guard.ps.current_term,
            payload: EntryPayload::Configuration(joint),
        };
        let index = Self::leader_append_entry(&mut guard, entry, cancel).await?;
        Self::leader_sync(&mut guard, cancel).await?;
        guard.check_invariants();
        Ok(index)
    }

    // Takes a snapshot of the applied state and discards the log prefix it
    // covers. Returns the index the log is anchored on afterwards.
    pub async fn compact_log(&self, cancel: &Cancel) -> RaftResult<Index> {
        let mut guard = self.inner.lock().await;
        guard.check_invariants();
        if !guard.is_initialized() {
            return Err(RaftError::InvalidState(
                "no applied state to snapshot".to_string(),
            ));
        }
        let target = guard.last_applied;
        if target > guard.ps.log.prev_index {
            let config = match guard.ps.log.config_at_or_below(target) {
                Some((_, config)) => config.clone(),
                None => guard.ps.snapshot_config.clone().expect("initialized"),
            };
            guard.ps.snapshot_state = Some(guard.state_machine.clone());
            guard.ps.snapshot_config = Some(config);
            guard.ps.log.truncate_prefix_to(target);
            guard.persist(cancel).await?;
            info!(member = %guard.id, index = target, "compacted log into snapshot");
        }
        guard.check_invariants();
        Ok(guard.ps.log.prev_index)
    }

    // Asserts that the supplied members are in a consistent collective
    // state: at most one leader per term, matching logs, agreeing applied
    // states. Acquires every member's mutex, so this is only for tests.
    pub async fn check_invariants(members: &[&Member<S>]) {
        let mut guards = Vec::with_capacity(members.len());
        for member in members {
            guards.push(member.inner.lock().await);
        }
        for guard in &guards {
            guard.check_invariants();
        }
        let views: Vec<&MemberInner<S>> = guards.iter().map(|g| &**g).collect();
        invariants::check_cluster(&views);
    }

    // ------------------------------------------------------------------
    // Inbound RPC handlers (Figures 2 and 13 of the Raft paper). Persistent
    // state is always flushed before a reply that commits us to it leaves
    // the handler.
    // ------------------------------------------------------------------

    pub async fn on_request_vote(
        &self,
        request: RequestVoteRequest,
        cancel: &Cancel,
    ) -> RaftResult<RequestVoteReply> {
        let mut guard = self.inner.lock().await;
        guard.check_invariants();

        let mut dirty = false;
        if request.term > guard.ps.current_term {
            info!(member = %guard.id, other_term = request.term, role = ?guard.mode, "detected higher term");
            guard.update_term(request.term);
            // Deliberately no election timer reset here; only a granted vote
            // may postpone our own candidacy.
            guard.to_follower();
            dirty = true;
        }
        if request.term < guard.ps.current_term {
            return Ok(RequestVoteReply {
                term: guard.ps.current_term,
                vote_granted: false,
            });
        }

        let can_vote = guard.ps.voted_for.is_none()
            || guard.ps.voted_for == Some(request.candidate_id);
        let up_to_date = guard
            .ps
            .log
            .is_up_to_date(request.last_log_term, request.last_log_index);
        let granted = can_vote && up_to_date;
        if granted {
            guard.ps.voted_for = Some(request.candidate_id);
            guard.rearm_election_timer();
            dirty = true;
            debug!(member = %guard.id, term = guard.ps.current_term, candidate = %request.candidate_id, "granted vote");
        } else {
            debug!(member = %guard.id, term = guard.ps.current_term, candidate = %request.candidate_id, can_vote, up_to_date, "denied vote");
        }

        if dirty {
            guard.persist(cancel).await?;
        }
        guard.check_invariants();
        Ok(RequestVoteReply {
            term: guard.ps.current_term,
            vote_granted: granted,
        })
    }

    pub async fn on_append_entries(
        &self,
        request: AppendEntriesRequest<S>,
        cancel: &Cancel,
    ) -> RaftResult<AppendEntriesReply> {
        let mut guard = self.inner.lock().await;
        guard.check_invariants();

        let mut dirty = false;
        if request.term > guard.ps.current_term {
            info!(member = %guard.id, other_term = request.term, role = ?guard.mode, "detected higher term");
            guard.update_term(request.term);
            guard.step_down();
            dirty = true;
        }
        if request.term < guard.ps.current_term {
            return Ok(AppendEntriesReply {
                term: guard.ps.current_term,
                success: false,
            });
        }

        // Same term: the sender won this term's election. A candidate of the
        // same term concedes; a second leader would mean election safety is
        // broken.
        assert!(
            guard.mode != Mode::Leader,
            "two leaders in term {}",
            guard.ps.current_term
        );
        if guard.mode == Mode::Candidate {
            guard.step_down();
        }
        guard.set_leader(request.leader_id);
        guard.rearm_election_timer();

        // Reject unless our log has an entry matching the anchor. Anything
        // at or below our own snapshot point is committed and thus matches.
        let prev_index = request.entries.prev_index;
        let prev_term = request.entries.prev_term;
        let log_ok = prev_index <= guard.ps.log.latest_index()
            && (prev_index < guard.ps.log.prev_index
                || guard.ps.log.term_at(prev_index) == prev_term);
        if !log_ok {
            if dirty {
                guard.persist(cancel).await?;
            }
            debug!(
                member = %guard.id,
                prev_index,
                prev_term,
                latest = guard.ps.log.latest_index(),
                "rejecting append, log mismatch"
            );
            guard.check_invariants();
            return Ok(AppendEntriesReply {
                term: guard.ps.current_term,
                success: false,
            });
        }

        // Append the new entries, truncating any conflicting suffix first.
        for (index, entry) in request.entries.iter() {
            if index <= guard.ps.log.prev_index {
                continue;
            }
            if index <= guard.ps.log.latest_index() {
                if guard.ps.log.term_at(index) == entry.term {
                    continue;
                }
                assert!(
                    index > guard.commit_index,
                    "conflicting entry below the commit index"
                );
                guard.ps.log.truncate_suffix_from(index);
            }
            guard.ps.log.append(entry.clone());
            dirty = true;
        }

        if dirty {
            guard.persist(cancel).await?;
        }

        let new_commit = request.leader_commit.min(guard.ps.log.latest_index());
        if new_commit > guard.commit_index {
            guard.update_commit_index(new_commit);
        }

        guard.check_invariants();
        Ok(AppendEntriesReply {
            term: guard.ps.current_term,
            success: true,
        })
    }

    pub async fn on_install_snapshot(
        &self,
        request: InstallSnapshotRequest<S>,
        cancel: &Cancel,
    ) -> RaftResult<InstallSnapshotReply> {
        let mut guard = self.inner.lock().await;
        guard.check_invariants();

        let mut dirty = false;
        if request.term > guard.ps.current_term {
            info!(member = %guard.id, other_term = request.term, role = ?guard.mode, "detected higher term");
            guard.update_term(request.term);
            guard.step_down();
            dirty = true;
        }
        if request.term < guard.ps.current_term {
            return Ok(InstallSnapshotReply {
                term: guard.ps.current_term,
            });
        }

        assert!(
            guard.mode != Mode::Leader,
            "two leaders in term {}",
            guard.ps.current_term
        );
        if guard.mode == Mode::Candidate {
            guard.step_down();
        }
        guard.set_leader(request.leader_id);
        guard.rearm_election_timer();

        let last_index = request.last_included_index;
        let last_term = request.last_included_term;
        if last_index > guard.ps.log.prev_index {
            // Figure 13: if our log has a matching entry at the snapshot
            // point, the entries after it are still valid; otherwise the
            // whole log is superseded.
            if last_index <= guard.ps.log.latest_index()
                && guard.ps.log.term_at(last_index) == last_term
            {
                guard.ps.log.truncate_prefix_to(last_index);
            } else {
                guard.ps.log = LogSlice::new(last_index, last_term);
            }
            guard.ps.snapshot_state = Some(request.snapshot_state.clone());
            guard.ps.snapshot_config = Some(request.snapshot_config.clone());
            dirty = true;

            if guard.commit_index < last_index {
                guard.commit_index = last_index;
            }
            if guard.last_applied < last_index {
                guard.state_machine = request.snapshot_state;
                guard.last_applied = last_index;
                guard.state_watch.send_replace(guard.state_machine.clone());
            }
            guard.initialized_watch.send_if_modified(|initialized| {
                if *initialized {
                    false
                } else {
                    *initialized = true;
                    true
                }
            });
            // Retained entries beyond the snapshot may already be committed.
            guard.apply_committed();
            info!(member = %guard.id, index = last_index, term = last_term, "installed snapshot");
        } else {
            debug!(member = %guard.id, index = last_index, "ignoring stale snapshot");
        }

        if dirty {
            guard.persist(cancel).await?;
        }
        guard.check_invariants();
        Ok(InstallSnapshotReply {
            term: guard.ps.current_term,
        })
    }

    // ------------------------------------------------------------------
    // Watchdog: periodically checks whether a follower should stand for
    // election.
    // ------------------------------------------------------------------

    async fn watchdog_loop(inner: Arc<Mutex<MemberInner<S>>>, cancel: Cancel) {
        let interval = { inner.lock().await.options.heartbeat_interval };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(interval) => {}
            }

            let mut guard = inner.lock().await;
            if guard.mode != Mode::Follower {
                continue;
            }
            // A member with no configuration is a non-voting member waiting
            // for its first snapshot; it never stands for election. Neither
            // does a member the current configuration would reject as
            // leader.
            if guard.ps.snapshot_config.is_none() {
                continue;
            }
            if !guard.effective_config().is_valid_leader(guard.id) {
                continue;
            }
            if !guard.election_timer_elapsed() {
                continue;
            }

            debug!(member = %guard.id, term = guard.ps.current_term, "election timeout, becoming candidate");
            guard.mode = Mode::Candidate;
            let task_inner = inner.clone();
            let task_cancel = cancel.clone();
            tokio::spawn(async move {
                Self::candidate_and_leader(task_inner, task_cancel).await;
            });
        }
    }

    // ------------------------------------------------------------------
    // Candidate-and-leader activity. Spawned by the watchdog; runs one
    // election round and, if elected, leads until the term moves on.
    // ------------------------------------------------------------------

    async fn candidate_and_leader(inner: Arc<Mutex<MemberInner<S>>>, cancel: Cancel) {
        let (outcome, term) = Self::run_election(&inner, &cancel).await;
        if outcome == ElectionOutcome::Elected {
            Self::lead(&inner, term, &cancel).await;
        }

        // Wind down: if we still own the state for this term, return to
        // follower with a fresh randomized timer so the watchdog can
        // retrigger. If the term has moved on, someone else owns it.
        let mut guard = inner.lock().await;
        if guard.ps.current_term == term && guard.mode != Mode::Follower {
            guard.step_down();
        }
        guard.check_invariants();
    }

    // Runs a single election round: increments the term, votes for itself,
    // and collects votes until elected, outvoted, or timed out. Returns the
    // outcome together with the term the election ran at.
    async fn run_election(
        inner: &Arc<Mutex<MemberInner<S>>>,
        cancel: &Cancel,
    ) -> (ElectionOutcome, Term) {
        let (request, config, others, network, rpc_timeout, round_timeout) = {
            let mut guard = inner.lock().await;
            if guard.mode != Mode::Candidate {
                // Stepped down before we even started.
                return (ElectionOutcome::Timeout, guard.ps.current_term);
            }
            let term = guard.ps.current_term + 1;
            guard.update_term(term);
            guard.ps.voted_for = Some(guard.id);
            guard.rearm_election_timer();
            if let Err(e) = guard.persist(cancel).await {
                warn!(member = %guard.id, "failed to persist candidacy: {}", e);
                return (ElectionOutcome::Cancelled, term);
            }
            info!(member = %guard.id, term, "starting election");

            let config = guard.effective_config();
            let request = RequestVoteRequest {
                term,
                candidate_id: guard.id,
                last_log_index: guard.ps.log.latest_index(),
                last_log_term: guard.ps.log.latest_term(),
            };
            let others: Vec<MemberId> = config
                .all_voting_members()
                .into_iter()
                .filter(|peer| *peer != guard.id)
                .collect();
            guard.check_invariants();
            (
                request,
                config,
                others,
                guard.network.clone(),
                guard.options.rpc_timeout,
                guard.election_timeout,
            )
        };
        let term = request.term;
        let self_id = request.candidate_id;

        let mut granted: BTreeSet<MemberId> = BTreeSet::new();
        granted.insert(self_id);
        let mut undecided: BTreeSet<MemberId> = others.iter().cloned().collect();

        let mut replies: FuturesUnordered<_> = others
            .iter()
            .map(|peer| {
                let peer = *peer;
                let network = network.clone();
                let request = request.clone();
                let cancel = cancel.clone();
                async move {
                    let result =
                        timeout(rpc_timeout, network.send_request_vote(peer, request, &cancel))
                            .await;
                    (peer, result)
                }
            })
            .collect();

        let deadline = sleep(round_timeout);
        tokio::pin!(deadline);

        loop {
            if config.is_quorum(&granted) {
                let mut guard = inner.lock().await;
                if guard.mode != Mode::Candidate || guard.ps.current_term != term {
                    return (ElectionOutcome::Timeout, term);
                }
                info!(member = %guard.id, term, "won election");
                guard.mode = Mode::Leader;
                let self_id = guard.id;
                guard.set_leader(self_id);

                // Peers start one past our current log; the no-op below
                // lands exactly there, so every replicator ships it first.
                let next_index = guard.ps.log.latest_index() + 1;
                guard.peers = config
                    .all_members()
                    .into_iter()
                    .filter(|peer| *peer != guard.id)
                    .map(|peer| {
                        (
                            peer,
                            PeerProgress {
                                next_index,
                                match_index: 0,
                            },
                        )
                    })
                    .collect();

                // Raft paper, Section 8: commit an entry of the new term as
                // soon as possible so earlier-term entries commit with it.
                let noop = LogEntry {
                    term,
                    payload: EntryPayload::NoOp,
                };
                if let Err(e) = Self::leader_append_entry(&mut guard, noop, cancel).await {
                    warn!(member = %guard.id, "failed to persist no-op: {}", e);
                    return (ElectionOutcome::Cancelled, term);
                }
                if let Err(e) = Self::leader_sync(&mut guard, cancel).await {
                    warn!(member = %guard.id, "failed to sync after election: {}", e);
                    return (ElectionOutcome::Cancelled, term);
                }
                guard.check_invariants();
                return (ElectionOutcome::Elected, term);
            }

            let possible: BTreeSet<MemberId> = granted.union(&undecided).cloned().collect();
            if !config.is_quorum(&possible) {
                debug!(member = %self_id, term, "lost election");
                return (ElectionOutcome::Timeout, term);
            }

            tokio::select! {
                _ = cancel.cancelled() => return (ElectionOutcome::Cancelled, term),
                _ = &mut deadline => {
                    debug!(member = %self_id, term, "election timed out");
                    return (ElectionOutcome::Timeout, term);
                }
                next = replies.next() => {
                    let (peer, result) = match next {
                        Some(reply) => reply,
                        None => continue,
                    };
                    undecided.remove(&peer);
                    match result {
                        Err(_elapsed) => {}
                        Ok(Err(RaftError::Cancelled)) => return (ElectionOutcome::Cancelled, term),
                        Ok(Err(e)) => {
                            debug!(member = %self_id, %peer, term, "vote request failed: {}", e);
                        }
                        Ok(Ok(reply)) => {
                            if reply.term > term {
                                let mut guard = inner.lock().await;
                                if reply.term > guard.ps.current_term {
                                    info!(member = %guard.id, other_term = reply.term, "detected higher term");
                                    guard.update_term(reply.term);
                                    guard.step_down();
                                    if let Err(e) = guard.persist(cancel).await {
                                        warn!(member = %guard.id, "failed to persist term: {}", e);
                                    }
                                }
                                return (ElectionOutcome::HigherTerm, term);
                            }
                            if reply.vote_granted {
                                granted.insert(peer);
                            }
                        }
                    }
                }
            }
        }
    }

    // The leader's main activity: keeps the per-peer replicators in sync
    // with the membership until the term moves on or we step down. The
    // replicator guards live here, so leaving this function stops them all.
    async fn lead(inner: &Arc<Mutex<MemberInner<S>>>, term: Term, cancel: &Cancel) {
        let heartbeat = { inner.lock().await.options.heartbeat_interval };
        let mut replicators: HashMap<MemberId, TaskGuard> = HashMap::new();
        loop {
            {
                let mut guard = inner.lock().await;
                if guard.mode != Mode::Leader || guard.ps.current_term != term {
                    return;
                }

                // Replicate to everyone in the effective configuration, and
                // also to everyone in the latest committed one so members on
                // their way out still learn about the configuration that
                // removes them.
                let mut targets = guard.effective_config().all_members();
                targets.extend(guard.committed_config().all_members());
                targets.remove(&guard.id);

                let next_index = guard.ps.log.latest_index() + 1;
                for peer in &targets {
                    guard.peers.entry(*peer).or_insert(PeerProgress {
                        next_index,
                        match_index: 0,
                    });
                    if !replicators.contains_key(peer) {
                        let task = tokio::spawn(Self::replicate_to_peer(
                            inner.clone(),
                            *peer,
                            term,
                            cancel.clone(),
                        ));
                        replicators
                            .insert(*peer, TaskGuard::new(&format!("replicate-{}", peer), task));
                    }
                }
                guard.peers.retain(|peer, _| targets.contains(peer));
                replicators.retain(|peer, _| targets.contains(peer));
                guard.check_invariants();
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(heartbeat) => {}
            }
        }
    }

    // Pushes append-entries or install-snapshot RPCs to one peer until the
    // peer is caught up, then keeps it warm with heartbeats.
    async fn replicate_to_peer(
        inner: Arc<Mutex<MemberInner<S>>>,
        peer: MemberId,
        term: Term,
        cancel: Cancel,
    ) {
        enum Payload<S: StateMachine> {
            Append(AppendEntriesRequest<S>),
            Snapshot(InstallSnapshotRequest<S>),
        }
        enum ReplyOutcome {
            Reached(Index),
            Rejected,
            PeerTerm(Term),
            Failed,
            Cancelled,
        }

        let (network, notify, heartbeat, rpc_timeout, leader_id) = {
            let guard = inner.lock().await;
            (
                guard.network.clone(),
                guard.update_notify.clone(),
                guard.options.heartbeat_interval,
                guard.options.rpc_timeout,
                guard.id,
            )
        };
        let mut connected = network.connected_members();

        loop {
            if cancel.is_cancelled() {
                return;
            }

            // Decide what the peer needs next.
            let payload = {
                let guard = inner.lock().await;
                if guard.mode != Mode::Leader || guard.ps.current_term != term {
                    return;
                }
                let progress = match guard.peers.get(&peer) {
                    Some(progress) => progress.clone(),
                    None => return,
                };
                if progress.next_index <= guard.ps.log.prev_index {
                    // The peer is behind our snapshot point.
                    Payload::Snapshot(InstallSnapshotRequest {
                        term,
                        leader_id,
                        last_included_index: guard.ps.log.prev_index,
                        last_included_term: guard.ps.log.prev_term,
                        snapshot_state: guard
                            .ps
                            .snapshot_state
                            .clone()
                            .expect("leader has a snapshot"),
                        snapshot_config: guard
                            .ps
                            .snapshot_config
                            .clone()
                            .expect("leader has a snapshot"),
                    })
                } else {
                    Payload::Append(AppendEntriesRequest {
                        term,
                        leader_id,
                        entries: guard.ps.log.slice_from(progress.next_index),
                        leader_commit: guard.commit_index,
                    })
                }
            };

            // Perform the RPC without holding the member lock.
            let outcome = match payload {
                Payload::Append(request) => {
                    let reached = request.entries.latest_index();
                    match timeout(
                        rpc_timeout,
                        network.send_append_entries(peer, request, &cancel),
                    )
                    .await
                    {
                        Err(_elapsed) => ReplyOutcome::Failed,
                        Ok(Err(RaftError::Cancelled)) => ReplyOutcome::Cancelled,
                        Ok(Err(e)) => {
                            debug!(%peer, term, "append failed: {}", e);
                            ReplyOutcome::Failed
                        }
                        Ok(Ok(reply)) if reply.term > term => ReplyOutcome::PeerTerm(reply.term),
                        Ok(Ok(reply)) if reply.success => ReplyOutcome::Reached(reached),
                        Ok(Ok(_)) => ReplyOutcome::Rejected,
                    }
                }
                Payload::Snapshot(request) => {
                    let reached = request.last_included_index;
                    match timeout(
                        rpc_timeout,
                        network.send_install_snapshot(peer, request, &cancel),
                    )
                    .await
                    {
                        Err(_elapsed) => ReplyOutcome::Failed,
                        Ok(Err(RaftError::Cancelled)) => ReplyOutcome::Cancelled,
                        Ok(Err(e)) => {
                            debug!(%peer, term, "snapshot install failed: {}", e);
                            ReplyOutcome::Failed
                        }
                        Ok(Ok(reply)) if reply.term > term => ReplyOutcome::PeerTerm(reply.term),
                        Ok(Ok(_)) => ReplyOutcome::Reached(reached),
                    }
                }
            };

            // Incorporate the reply.
            match outcome {
                ReplyOutcome::Cancelled => return,
                ReplyOutcome::PeerTerm(other_term) => {
                    let mut guard = inner.lock().await;
                    if other_term > guard.ps.current_term {
                        info!(member = %guard.id, other_term, role = ?guard.mode, "detected higher term");
                        guard.update_term(other_term);
                        guard.step_down();
                        if let Err(e) = guard.persist(&cancel).await {
                            warn!(member = %guard.id, "failed to persist term: {}", e);
                        }
                        guard.check_invariants();
                    }
                    return;
                }
                ReplyOutcome::Reached(reached) => {
                    let mut guard = inner.lock().await;
                    if guard.mode != Mode::Leader || guard.ps.current_term != term {
                        return;
                    }
                    if let Some(progress) = guard.peers.get_mut(&peer) {
                        if reached > progress.match_index {
                            progress.match_index = reached;
                        }
                        progress.next_index = progress.match_index + 1;
                    }
                    if let Err(e) = Self::leader_sync(&mut guard, &cancel).await {
                        warn!(member = %guard.id, "failed to sync after replication: {}", e);
                        return;
                    }
                    guard.check_invariants();
                }
                ReplyOutcome::Rejected => {
                    // The peer is missing the entry before the ones we sent.
                    // Walk back one entry at a time until the logs meet
                    // (Raft paper, Section 5.3).
                    let mut guard = inner.lock().await;
                    if guard.mode != Mode::Leader || guard.ps.current_term != term {
                        return;
                    }
                    let self_id = guard.id;
                    if let Some(progress) = guard.peers.get_mut(&peer) {
                        if progress.next_index > 1 {
                            progress.next_index -= 1;
                        }
                        let next_index = progress.next_index;
                        debug!(member = %self_id, %peer, next_index, "append rejected, walking back");
                    }
                    continue;
                }
                ReplyOutcome::Failed => {
                    // Wait for the peer to come back, but keep trying at
                    // heartbeat pace regardless; the connectivity signal is
                    // advisory.
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(heartbeat) => {}
                        _ = async {
                            loop {
                                if connected.borrow_and_update().contains(&peer) {
                                    return;
                                }
                                if connected.changed().await.is_err() {
                                    pending::<()>().await;
                                }
                            }
                        } => {}
                    }
                    continue;
                }
            }

            // If the peer is caught up, wait for news or the next heartbeat.
            let caught_up = {
                let guard = inner.lock().await;
                if guard.mode != Mode::Leader || guard.ps.current_term != term {
                    return;
                }
                match guard.peers.get(&peer) {
                    Some(progress) => progress.next_index > guard.ps.log.latest_index(),
                    None => return,
                }
            };
            if caught_up {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = notify.notified() => {}
                    _ = sleep(heartbeat) => {}
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Leader helpers. All run under the member mutex.
    // ------------------------------------------------------------------

    // Appends an entry to the leader's log, flushes it, and wakes the
    // replicators. Does not wait for the entry to commit.
    async fn leader_append_entry(
        guard: &mut MemberInner<S>,
        entry: LogEntry<S>,
        cancel: &Cancel,
    ) -> RaftResult<Index> {
        let index = guard.ps.log.append(entry);
        guard.persist(cancel).await?;
        guard.update_notify.notify_waiters();
        debug!(member = %guard.id, term = guard.ps.current_term, index, "appended entry");
        Ok(index)
    }

    // Drives commit advancement and the reconfiguration state machine to a
    // fixed point. Called after anything that could move `match_index` or
    // append to the log.
    async fn leader_sync(guard: &mut MemberInner<S>, cancel: &Cancel) -> RaftResult<()> {
        loop {
            let advanced = Self::advance_commit_once(guard);
            let appended = Self::continue_reconfiguration(guard, cancel).await?;
            if !advanced && !appended {
                return Ok(());
            }
        }
    }

    // Finds the largest index replicated to a quorum and commits up to it.
    // Only entries of the current term commit directly; earlier entries
    // commit with them (Raft paper, Section 5.4.2).
    fn advance_commit_once(guard: &mut MemberInner<S>) -> bool {
        if guard.mode != Mode::Leader {
            return false;
        }
        let config = guard.effective_config();
        let mut candidate = guard.ps.log.latest_index();
        while candidate > guard.commit_index {
            if guard.ps.log.term_at(candidate) != guard.ps.current_term {
                break;
            }
            let mut replicated: BTreeSet<MemberId> = BTreeSet::new();
            replicated.insert(guard.id);
            for (peer, progress) in &guard.peers {
                if progress.match_index >= candidate {
                    replicated.insert(*peer);
                }
            }
            if config.is_quorum(&replicated) {
                guard.update_commit_index(candidate);
                return true;
            }
            candidate -= 1;
        }
        false
    }

    // Advances the two-phase membership change: once the joint entry
    // commits, appends the final configuration; once the final entry
    // commits, steps down if it excludes us. Returns whether an entry was
    // appended.
    async fn continue_reconfiguration(
        guard: &mut MemberInner<S>,
        cancel: &Cancel,
    ) -> RaftResult<bool> {
        if guard.mode != Mode::Leader {
            return Ok(false);
        }
        let (config_index, config) = guard.effective_config_entry();
        if config_index > guard.commit_index {
            return Ok(false);
        }
        if let Some(new_config) = &config.new_config {
            info!(member = %guard.id, term = guard.ps.current_term, "joint consensus committed, appending final configuration");
            let entry = LogEntry {
                term: guard.ps.current_term,
                payload: EntryPayload::Configuration(ComplexConfig::single(new_config.clone())),
            };
            Self::leader_append_entry(guard, entry, cancel).await?;
            return Ok(true);
        }
        if !config.is_valid_leader(guard.id) {
            info!(member = %guard.id, term = guard.ps.current_term, "stepping down, excluded from the committed configuration");
            guard.step_down();
        }
        Ok(false)
    }
}

impl<S: StateMachine> Drop for Member<S> {
    fn drop(&mut self) {
        self.cancel_source.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeState, MemStorage, TestRouter};

    struct Fixture {
        member: Member<FakeState>,
        leader_id: MemberId,
        others: Vec<MemberId>,
    }

    // Creates a member of a three-member cluster without starting its
    // watchdog, so handlers can be exercised deterministically.
    fn create_member() -> Fixture {
        let id = MemberId::new_random();
        let others = vec![MemberId::new_random(), MemberId::new_random()];
        let mut all = others.clone();
        all.push(id);
        let config = Config::with_voters(all);

        let router: TestRouter<FakeState> = TestRouter::new();
        let network = Arc::new(router.handle(id));
        let storage = Arc::new(MemStorage::new());
        let member = Member::new(
            id,
            storage,
            network,
            PersistentState::make_initial(FakeState::default(), config),
            Options::default(),
        )
        .expect("member");
        Fixture {
            member,
            leader_id: others[0],
            others,
        }
    }

    fn append_request(
        fixture: &Fixture,
        term: Term,
        prev: (Index, Term),
        changes: &[(Term, u64)],
        leader_commit: Index,
    ) -> AppendEntriesRequest<FakeState> {
        let mut entries = LogSlice::new(prev.0, prev.1);
        for (entry_term, change) in changes {
            entries.append(LogEntry {
                term: *entry_term,
                payload: EntryPayload::Regular(*change),
            });
        }
        AppendEntriesRequest {
            term,
            leader_id: fixture.leader_id,
            entries,
            leader_commit,
        }
    }

    #[tokio::test]
    async fn test_initial_state() {
        let fixture = create_member();
        let status = fixture.member.status().await;
        assert_eq!(status.mode, Mode::Follower);
        assert_eq!(status.term, 0);
        assert_eq!(status.commit_index, 0);
        assert!(status.initialized);
        assert!(fixture.member.leader().is_nil());
    }

    #[tokio::test]
    async fn test_grant_vote() {
        let fixture = create_member();
        let candidate = fixture.others[0];
        let reply = fixture
            .member
            .on_request_vote(
                RequestVoteRequest {
                    term: 1,
                    candidate_id: candidate,
                    last_log_index: 0,
                    last_log_term: 0,
                },
                &Cancel::never(),
            )
            .await
            .expect("vote");
        assert_eq!(reply.term, 1);
        assert!(reply.vote_granted);

        // The same candidate asking again still gets the vote.
        let reply = fixture
            .member
            .on_request_vote(
                RequestVoteRequest {
                    term: 1,
                    candidate_id: candidate,
                    last_log_index: 0,
                    last_log_term: 0,
                },
                &Cancel::never(),
            )
            .await
            .expect("vote");
        assert!(reply.vote_granted);

        // A different candidate in the same term does not.
        let reply = fixture
            .member
            .on_request_vote(
                RequestVoteRequest {
                    term: 1,
                    candidate_id: fixture.others[1],
                    last_log_index: 5,
                    last_log_term: 1,
                },
                &Cancel::never(),
            )
            .await
            .expect("vote");
        assert!(!reply.vote_granted);
    }

    #[tokio::test]
    async fn test_deny_vote_stale_term() {
        let fixture = create_member();

        // Learn about term 3 first.
        fixture
            .member
            .on_append_entries(
                append_request(&fixture, 3, (0, 0), &[], 0),
                &Cancel::never(),
            )
            .await
            .expect("append");

        let reply = fixture
            .member
            .on_request_vote(
                RequestVoteRequest {
                    term: 2,
                    candidate_id: fixture.others[1],
                    last_log_index: 10,
                    last_log_term: 2,
                },
                &Cancel::never(),
            )
            .await
            .expect("vote");
        assert_eq!(reply.term, 3);
        assert!(!reply.vote_granted);
    }

    #[tokio::test]
    async fn test_deny_vote_stale_log() {
        let fixture = create_member();

        // Give the member a couple of entries at term 2.
        fixture
            .member
            .on_append_entries(
                append_request(&fixture, 2, (0, 0), &[(2, 1), (2, 2)], 0),
                &Cancel::never(),
            )
            .await
            .expect("append");

        // A candidate whose log ends at term 1 is not up to date.
        let reply = fixture
            .member
            .on_request_vote(
                RequestVoteRequest {
                    term: 3,
                    candidate_id: fixture.others[1],
                    last_log_index: 7,
                    last_log_term: 1,
                },
                &Cancel::never(),
            )
            .await
            .expect("vote");
        assert_eq!(reply.term, 3);
        assert!(!reply.vote_granted);

        // Same last term but a shorter log is not up to date either.
        let reply = fixture
            .member
            .on_request_vote(
                RequestVoteRequest {
                    term: 4,
                    candidate_id: fixture.others[1],
                    last_log_index: 1,
                    last_log_term: 2,
                },
                &Cancel::never(),
            )
            .await
            .expect("vote");
        assert!(!reply.vote_granted);
    }

    #[tokio::test]
    async fn test_append_entries_applies_committed() {
        let fixture = create_member();
        let reply = fixture
            .member
            .on_append_entries(
                append_request(&fixture, 1, (0, 0), &[(1, 10), (1, 20)], 2),
                &Cancel::never(),
            )
            .await
            .expect("append");
        assert!(reply.success);

        let status = fixture.member.status().await;
        assert_eq!(status.commit_index, 2);
        assert_eq!(status.last_applied, 2);
        assert_eq!(
            fixture.member.observe_state_machine().borrow().applied,
            vec![10, 20]
        );
        assert_eq!(fixture.member.leader(), fixture.leader_id);
    }

    #[tokio::test]
    async fn test_append_entries_idempotent() {
        let fixture = create_member();
        let request = append_request(&fixture, 1, (0, 0), &[(1, 10), (1, 20)], 2);

        let first = fixture
            .member
            .on_append_entries(request.clone(), &Cancel::never())
            .await
            .expect("append");
        let second = fixture
            .member
            .on_append_entries(request, &Cancel::never())
            .await
            .expect("append");
        assert!(first.success);
        assert!(second.success);

        // Applying the same request twice leaves log and state unchanged.
        let status = fixture.member.status().await;
        assert_eq!(status.latest_log_index, 2);
        assert_eq!(status.last_applied, 2);
        assert_eq!(
            fixture.member.observe_state_machine().borrow().applied,
            vec![10, 20]
        );
    }

    #[tokio::test]
    async fn test_append_entries_truncates_conflicts() {
        let fixture = create_member();
        fixture
            .member
            .on_append_entries(
                append_request(&fixture, 1, (0, 0), &[(1, 10), (1, 20), (1, 30)], 1),
                &Cancel::never(),
            )
            .await
            .expect("append");

        // A new leader overwrites the uncommitted tail.
        let reply = fixture
            .member
            .on_append_entries(
                append_request(&fixture, 2, (1, 1), &[(2, 21)], 1),
                &Cancel::never(),
            )
            .await
            .expect("append");
        assert!(reply.success);

        let status = fixture.member.status().await;
        assert_eq!(status.term, 2);
        assert_eq!(status.latest_log_index, 2);
    }

    #[tokio::test]
    async fn test_append_entries_rejects_gap_then_snapshot_fixes_it() {
        let fixture = create_member();

        // Entries far in the future get rejected.
        let request = append_request(&fixture, 12, (75, 10), &[(10, 76), (10, 77)], 0);
        let reply = fixture
            .member
            .on_append_entries(request.clone(), &Cancel::never())
            .await
            .expect("append");
        assert_eq!(reply.term, 12);
        assert!(!reply.success);

        // The member acknowledges the leader anyway.
        assert_eq!(fixture.member.leader(), fixture.leader_id);

        // Install a snapshot that covers the gap.
        let snapshot = InstallSnapshotRequest {
            term: 12,
            leader_id: fixture.leader_id,
            last_included_index: 75,
            last_included_term: 10,
            snapshot_state: FakeState {
                applied: vec![1, 2, 3],
            },
            snapshot_config: ComplexConfig::single(Config::with_voters(vec![
                fixture.member.id(),
                fixture.leader_id,
            ])),
        };
        let reply = fixture
            .member
            .on_install_snapshot(snapshot, &Cancel::never())
            .await
            .expect("install");
        assert_eq!(reply.term, 12);

        // The same append request now succeeds.
        let reply = fixture
            .member
            .on_append_entries(request, &Cancel::never())
            .await
            .expect("append");
        assert!(reply.success);

        let status = fixture.member.status().await;
        assert_eq!(status.log_prev_index, 75);
        assert_eq!(status.latest_log_index, 77);
        assert_eq!(status.last_applied, 75);
    }

    #[tokio::test]
    async fn test_install_snapshot_then_replay_matches_direct_application() {
        // Applying a snapshot at index 2 and then entries 3..=4 must yield
        // the same state as applying entries 1..=4 directly.
        let direct = create_member();
        direct
            .member
            .on_append_entries(
                append_request(&direct, 1, (0, 0), &[(1, 10), (1, 20), (1, 30), (1, 40)], 4),
                &Cancel::never(),
            )
            .await
            .expect("append");

        let via_snapshot = create_member();
        via_snapshot
            .member
            .on_install_snapshot(
                InstallSnapshotRequest {
                    term: 1,
                    leader_id: via_snapshot.leader_id,
                    last_included_index: 2,
                    last_included_term: 1,
                    snapshot_state: FakeState {
                        applied: vec![10, 20],
                    },
                    snapshot_config: ComplexConfig::single(Config::with_voters(vec![
                        via_snapshot.member.id(),
                    ])),
                },
                &Cancel::never(),
            )
            .await
            .expect("install");
        via_snapshot
            .member
            .on_append_entries(
                append_request(&via_snapshot, 1, (2, 1), &[(1, 30), (1, 40)], 4),
                &Cancel::never(),
            )
            .await
            .expect("append");

        let direct_state = direct.member.observe_state_machine().borrow().clone();
        let snapshot_state = via_snapshot
            .member
            .observe_state_machine()
            .borrow()
            .clone();
        assert_eq!(direct_state, snapshot_state);
        assert_eq!(
            direct.member.status().await.last_applied,
            via_snapshot.member.status().await.last_applied
        );
    }

    #[tokio::test]
    async fn test_stale_snapshot_ignored() {
        let fixture = create_member();
        fixture
            .member
            .on_append_entries(
                append_request(&fixture, 1, (0, 0), &[(1, 10), (1, 20), (1, 30)], 3),
                &Cancel::never(),
            )
            .await
            .expect("append");

        // A snapshot below what we already applied must not rewind state.
        fixture
            .member
            .on_install_snapshot(
                InstallSnapshotRequest {
                    term: 1,
                    leader_id: fixture.leader_id,
                    last_included_index: 2,
                    last_included_term: 1,
                    snapshot_state: FakeState {
                        applied: vec![10, 20],
                    },
                    snapshot_config: ComplexConfig::single(Config::with_voters(vec![
                        fixture.member.id(),
                    ])),
                },
                &Cancel::never(),
            )
            .await
            .expect("install");

        let status = fixture.member.status().await;
        assert_eq!(status.last_applied, 3);
        assert_eq!(status.commit_index, 3);
        assert_eq!(
            fixture.member.observe_state_machine().borrow().applied,
            vec![10, 20, 30]
        );
    }

    #[tokio::test]
    async fn test_propose_fails_when_not_leader() {
        let fixture = create_member();
        let result = fixture
            .member
            .propose_change(42, &Cancel::never())
            .await;
        assert!(matches!(result, Err(RaftError::NotLeader)));

        let result = fixture
            .member
            .propose_config_change(
                Config::with_voters(vec![fixture.member.id()]),
                &Cancel::never(),
            )
            .await;
        assert!(matches!(result, Err(RaftError::NotLeader)));
    }

    #[tokio::test]
    async fn test_stale_append_rejected() {
        let fixture = create_member();

        // Move to term 5.
        fixture
            .member
            .on_append_entries(
                append_request(&fixture, 5, (0, 0), &[], 0),
                &Cancel::never(),
            )
            .await
            .expect("append");

        // An append from an older term is refused and told the new term.
        let reply = fixture
            .member
            .on_append_entries(
                append_request(&fixture, 4, (0, 0), &[(4, 1)], 0),
                &Cancel::never(),
            )
            .await
            .expect("append");
        assert_eq!(reply.term, 5);
        assert!(!reply.success);
    }
}
