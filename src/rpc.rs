use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::watch;

use crate::config::ComplexConfig;
use crate::error::RaftResult;
use crate::log::LogSlice;
use crate::state_machine::StateMachine;
use crate::sync::Cancel;
use crate::types::{Index, MemberId, Term};

// The RPC types below are the parameters and results of the RequestVote,
// AppendEntries, and InstallSnapshot RPCs from Figures 2 and 13 of the Raft
// paper. They are plain values; how they travel between members is entirely
// the `Network` implementation's business.

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: MemberId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

// `entries` covers three of the paper's parameters at once: `prevLogIndex`
// and `prevLogTerm` are the slice anchor, and the slice contents are the
// entries to append. An empty slice is a heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: StateMachine")]
pub struct AppendEntriesRequest<S: StateMachine> {
    pub term: Term,
    pub leader_id: MemberId,
    pub entries: LogSlice<S>,
    pub leader_commit: Index,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
}

// The paper ships snapshots as a sequence of binary chunks; we ship the
// state and configuration values directly instead, replacing the paper's
// `offset`, `data`, and `done` parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: StateMachine")]
pub struct InstallSnapshotRequest<S: StateMachine> {
    pub term: Term,
    pub leader_id: MemberId,
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub snapshot_state: S,
    pub snapshot_config: ComplexConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: Term,
}

// How a member sends messages to its peers. The `send_*` methods deliver
// the request by invoking the matching `on_*` handler on the destination
// member and return its reply.
//
// A `RaftError::Network` return means the RPC may or may not have been
// delivered; callers should wait until the peer shows up in
// `connected_members` before trying again. If the cancel signal fires the
// methods return `RaftError::Cancelled`, and again the RPC may or may not
// have been delivered.
#[async_trait]
pub trait Network<S: StateMachine>: Send + Sync {
    async fn send_request_vote(
        &self,
        dest: MemberId,
        request: RequestVoteRequest,
        cancel: &Cancel,
    ) -> RaftResult<RequestVoteReply>;

    async fn send_append_entries(
        &self,
        dest: MemberId,
        request: AppendEntriesRequest<S>,
        cancel: &Cancel,
    ) -> RaftResult<AppendEntriesReply>;

    async fn send_install_snapshot(
        &self,
        dest: MemberId,
        request: InstallSnapshotRequest<S>,
        cancel: &Cancel,
    ) -> RaftResult<InstallSnapshotReply>;

    // The set of members an RPC is currently likely to reach.
    fn connected_members(&self) -> watch::Receiver<BTreeSet<MemberId>>;
}
