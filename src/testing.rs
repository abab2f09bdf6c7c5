// In-process fakes for the storage and network collaborators, plus a small
// cluster harness. Everything a real deployment does over disks and sockets
// happens here through direct calls, which keeps the end-to-end tests fast
// and deterministic enough to assert on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::config::Config;
use crate::error::{RaftError, RaftResult};
use crate::member::{Member, Mode, Options};
use crate::persistence::{PersistentState, Storage};
use crate::rpc::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    Network, RequestVoteReply, RequestVoteRequest,
};
use crate::state_machine::StateMachine;
use crate::sync::Cancel;
use crate::types::MemberId;

// A state machine that remembers every change applied to it, in order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeState {
    pub applied: Vec<u64>,
}

impl StateMachine for FakeState {
    type Change = u64;

    fn apply_change(&mut self, change: &u64) {
        self.applied.push(*change);
    }
}

// Keeps the latest persisted state in memory. Supports reading it back to
// simulate a restart.
pub struct MemStorage<S: StateMachine> {
    state: StdMutex<Option<PersistentState<S>>>,
}

impl<S: StateMachine> MemStorage<S> {
    pub fn new() -> Self {
        MemStorage {
            state: StdMutex::new(None),
        }
    }

    // Returns the state as of the last durable write, as a restart would
    // see it.
    pub fn read(&self) -> Option<PersistentState<S>> {
        self.state.lock().unwrap().clone()
    }
}

impl<S: StateMachine> Default for MemStorage<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: StateMachine> Storage<S> for MemStorage<S> {
    async fn write_persistent_state(
        &self,
        state: &PersistentState<S>,
        cancel: &Cancel,
    ) -> RaftResult<()> {
        if cancel.is_cancelled() {
            return Err(RaftError::Cancelled);
        }
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

// Routes RPCs between registered members by calling their handlers
// directly. Members can be disconnected to simulate partitions; a
// disconnected member can neither send nor receive. Clones share the same
// underlying network.
pub struct TestRouter<S: StateMachine> {
    state: Arc<StdMutex<RouterState<S>>>,
}

impl<S: StateMachine> Clone for TestRouter<S> {
    fn clone(&self) -> Self {
        TestRouter {
            state: self.state.clone(),
        }
    }
}

struct RouterState<S: StateMachine> {
    members: HashMap<MemberId, Arc<Member<S>>>,
    disconnected: BTreeSet<MemberId>,
    watchers: HashMap<MemberId, watch::Sender<BTreeSet<MemberId>>>,
}

impl<S: StateMachine> TestRouter<S> {
    pub fn new() -> Self {
        TestRouter {
            state: Arc::new(StdMutex::new(RouterState {
                members: HashMap::new(),
                disconnected: BTreeSet::new(),
                watchers: HashMap::new(),
            })),
        }
    }

    // Returns the network handle for the given member. Must be called
    // before constructing the member, since the member wants its network at
    // build time.
    pub fn handle(&self, id: MemberId) -> TestNetwork<S> {
        let mut state = self.state.lock().unwrap();
        let connected = Self::connected_set(&state);
        let (tx, rx) = watch::channel(connected);
        state.watchers.insert(id, tx);
        TestNetwork {
            id,
            router: self.clone(),
            connected: rx,
        }
    }

    pub fn register(&self, member: Arc<Member<S>>) {
        let mut state = self.state.lock().unwrap();
        state.members.insert(member.id(), member);
        Self::broadcast(&mut state);
    }

    pub fn unregister(&self, id: MemberId) {
        let mut state = self.state.lock().unwrap();
        state.members.remove(&id);
        Self::broadcast(&mut state);
    }

    // Cuts the member off: RPCs to and from it fail until `reconnect`.
    pub fn disconnect(&self, id: MemberId) {
        let mut state = self.state.lock().unwrap();
        state.disconnected.insert(id);
        Self::broadcast(&mut state);
    }

    pub fn reconnect(&self, id: MemberId) {
        let mut state = self.state.lock().unwrap();
        state.disconnected.remove(&id);
        Self::broadcast(&mut state);
    }

    fn connected_set(state: &RouterState<S>) -> BTreeSet<MemberId> {
        state
            .members
            .keys()
            .filter(|id| !state.disconnected.contains(id))
            .cloned()
            .collect()
    }

    fn broadcast(state: &mut RouterState<S>) {
        let connected = Self::connected_set(state);
        for tx in state.watchers.values() {
            tx.send_replace(connected.clone());
        }
    }

    fn route(&self, src: MemberId, dest: MemberId) -> RaftResult<Arc<Member<S>>> {
        let state = self.state.lock().unwrap();
        if state.disconnected.contains(&src) || state.disconnected.contains(&dest) {
            return Err(RaftError::Network {
                peer: dest,
                message: "unreachable".to_string(),
            });
        }
        state
            .members
            .get(&dest)
            .cloned()
            .ok_or_else(|| RaftError::Network {
                peer: dest,
                message: "unknown member".to_string(),
            })
    }
}

// One member's view of the test network.
pub struct TestNetwork<S: StateMachine> {
    id: MemberId,
    router: TestRouter<S>,
    connected: watch::Receiver<BTreeSet<MemberId>>,
}

#[async_trait]
impl<S: StateMachine> Network<S> for TestNetwork<S> {
    async fn send_request_vote(
        &self,
        dest: MemberId,
        request: RequestVoteRequest,
        cancel: &Cancel,
    ) -> RaftResult<RequestVoteReply> {
        let member = self.router.route(self.id, dest)?;
        member.on_request_vote(request, cancel).await
    }

    async fn send_append_entries(
        &self,
        dest: MemberId,
        request: AppendEntriesRequest<S>,
        cancel: &Cancel,
    ) -> RaftResult<AppendEntriesReply> {
        let member = self.router.route(self.id, dest)?;
        member.on_append_entries(request, cancel).await
    }

    async fn send_install_snapshot(
        &self,
        dest: MemberId,
        request: InstallSnapshotRequest<S>,
        cancel: &Cancel,
    ) -> RaftResult<InstallSnapshotReply> {
        let member = self.router.route(self.id, dest)?;
        member.on_install_snapshot(request, cancel).await
    }

    fn connected_members(&self) -> watch::Receiver<BTreeSet<MemberId>> {
        self.connected.clone()
    }
}

// Options small enough to keep multi-second scenarios out of the test
// suite while preserving the heartbeat-much-smaller-than-election-timeout
// relationship.
pub fn test_options() -> Options {
    Options {
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(50),
        rpc_timeout: Duration::from_millis(50),
    }
}

// A cluster of members backed by a shared router, all managing `FakeState`.
pub struct TestCluster {
    pub router: TestRouter<FakeState>,
    pub members: Vec<Arc<Member<FakeState>>>,
    pub storages: HashMap<MemberId, Arc<MemStorage<FakeState>>>,
    pub options: Options,
}

impl TestCluster {
    // Launches `size` members that all start from the same initial state
    // and all-voting configuration.
    pub async fn launch(size: usize, options: Options) -> TestCluster {
        let ids: Vec<MemberId> = (0..size).map(|_| MemberId::new_random()).collect();
        let config = Config::with_voters(ids.clone());
        let router = TestRouter::new();

        let mut members = Vec::new();
        let mut storages = HashMap::new();
        for id in ids {
            let storage = Arc::new(MemStorage::new());
            let network = Arc::new(router.handle(id));
            let member = Arc::new(
                Member::new(
                    id,
                    storage.clone(),
                    network,
                    PersistentState::make_initial(FakeState::default(), config.clone()),
                    options.clone(),
                )
                .expect("member"),
            );
            router.register(member.clone());
            member.start().await;
            storages.insert(id, storage);
            members.push(member);
        }

        TestCluster {
            router,
            members,
            storages,
            options,
        }
    }

    // Adds a member that joins with no state, awaiting a snapshot.
    pub async fn add_joiner(&mut self) -> Arc<Member<FakeState>> {
        let id = MemberId::new_random();
        let storage = Arc::new(MemStorage::new());
        let network = Arc::new(self.router.handle(id));
        let member = Arc::new(
            Member::new(
                id,
                storage.clone(),
                network,
                PersistentState::make_join(),
                self.options.clone(),
            )
            .expect("member"),
        );
        self.router.register(member.clone());
        member.start().await;
        self.storages.insert(id, storage);
        self.members.push(member.clone());
        member
    }

    pub fn member(&self, id: MemberId) -> Arc<Member<FakeState>> {
        self.members
            .iter()
            .find(|m| m.id() == id)
            .expect("unknown member")
            .clone()
    }

    // Waits until some member considers itself leader and returns it. With
    // several transient leaders across terms, the one with the highest term
    // wins.
    pub async fn wait_for_leader(&self, limit: Duration) -> Arc<Member<FakeState>> {
        let start = tokio::time::Instant::now();
        while start.elapsed() < limit {
            let mut best: Option<(u64, Arc<Member<FakeState>>)> = None;
            for member in &self.members {
                let status = member.status().await;
                if status.mode == Mode::Leader {
                    let better = match &best {
                        Some((term, _)) => status.term > *term,
                        None => true,
                    };
                    if better {
                        best = Some((status.term, member.clone()));
                    }
                }
            }
            if let Some((_, member)) = best {
                return member;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected in time");
    }

    // Proposes through whoever currently leads, retrying across leader
    // changes. Returns the leader that accepted the change.
    pub async fn must_propose(&self, change: u64, limit: Duration) -> Arc<Member<FakeState>> {
        let start = tokio::time::Instant::now();
        while start.elapsed() < limit {
            let leader = self.wait_for_leader(limit).await;
            match leader.propose_change(change, &Cancel::never()).await {
                Ok(_) => return leader,
                Err(RaftError::NotLeader) => sleep(Duration::from_millis(10)).await,
                Err(e) => panic!("propose failed: {}", e),
            }
        }
        panic!("could not propose change {}", change);
    }

    pub async fn check_invariants(&self) {
        let refs: Vec<&Member<FakeState>> = self.members.iter().map(|m| m.as_ref()).collect();
        Member::check_invariants(&refs).await;
    }
}

/// Polls a condition until it holds, or fails after `limit`.
pub async fn wait_for<F, Fut>(limit: Duration, mut condition: F) -> Result<(), ()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < limit {
        if condition().await {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }
    Err(())
}
