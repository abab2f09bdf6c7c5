use thiserror::Error;

use crate::types::MemberId;

/// A specialized `Result` type for Raft operations.
pub type RaftResult<T> = Result<T, RaftError>;

/// Structured error type used throughout the crate.
#[derive(Error, Debug)]
pub enum RaftError {
    /// A proposal was rejected because this member is not the leader. Never
    /// fatal; callers should redirect to the current leader and retry.
    #[error("not the leader")]
    NotLeader,

    /// A configuration change was rejected because an earlier one has not
    /// finished both phases yet.
    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,

    /// The operation was interrupted by its cancel signal. The member is
    /// left in an undefined internal state and must be destroyed.
    #[error("operation cancelled")]
    Cancelled,

    /// The storage collaborator failed a required persist.
    #[error("storage error: {0}")]
    Storage(String),

    /// An RPC to a peer failed; it may or may not have been delivered.
    #[error("network error sending to {peer}: {message}")]
    Network { peer: MemberId, message: String },

    /// A persistent-state value failed validation on load.
    #[error("invalid persistent state: {0}")]
    InvalidState(String),
}
