// This crate implements the core of the Raft consensus algorithm for a
// single cluster member: leader election, log replication, log compaction
// via snapshots, and joint-consensus membership changes.
//
// The implementation follows the paper "In Search of an Understandable
// Consensus Algorithm (Extended Version)" (2014) by Diego Ongaro and John
// Ousterhout, and refers back to it regularly:
// https://raft.github.io/raft.pdf
//
// Networking and durable storage are deliberately not part of this crate.
// A `Member` talks to the outside world through the `Storage` and `Network`
// traits, which both makes the core easy to reason about and lets the whole
// protocol run against the in-process fakes in the `testing` module. Users
// supply an implementation of the `StateMachine` trait; the member then
// guarantees that every member of the cluster applies the same changes in
// the same order.

mod config;
mod error;
mod invariants;
mod log;
mod member;
mod persistence;
mod rpc;
mod state_machine;
mod sync;
mod types;

pub mod testing;

pub use config::{ComplexConfig, Config};
pub use error::{RaftError, RaftResult};
pub use log::{EntryPayload, LogEntry, LogSlice};
pub use member::{Member, MemberStatus, Mode, Options};
pub use persistence::{PersistentState, Storage};
pub use rpc::{
    AppendEntriesReply, AppendEntriesRequest, InstallSnapshotReply, InstallSnapshotRequest,
    Network, RequestVoteReply, RequestVoteRequest,
};
pub use state_machine::StateMachine;
pub use sync::{Cancel, CancelSource};
pub use types::{Index, MemberId, Term};
