use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ComplexConfig, Config};
use crate::error::{RaftError, RaftResult};
use crate::log::LogSlice;
use crate::state_machine::StateMachine;
use crate::sync::Cancel;
use crate::types::{MemberId, Term};

// Everything a member must keep on stable storage across restarts. The
// whole value is handed to the `Storage` collaborator whenever any part of
// it changes, and handed back to the `Member` constructor on restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: StateMachine")]
pub struct PersistentState<S: StateMachine> {
    // `current_term` and `voted_for` correspond to the variables with the
    // same names in Figure 2 of the Raft paper.
    pub current_term: Term,
    pub voted_for: Option<MemberId>,

    // The snapshotted state and configuration, as described in Section 7 of
    // the Raft paper. Members that join an established cluster start with
    // neither; such a member assumes it is non-voting and never stands for
    // election until its first snapshot arrives.
    pub snapshot_state: Option<S>,
    pub snapshot_config: Option<ComplexConfig>,

    // `log.prev_index` and `log.prev_term` are the "last included index"
    // and "last included term" of the snapshot.
    pub log: LogSlice<S>,
}

impl<S: StateMachine> PersistentState<S> {
    // Returns the persistent state for a member of a brand-new cluster.
    // Every member of the new cluster must start from the same state and
    // configuration.
    pub fn make_initial(initial_state: S, initial_config: Config) -> Self {
        PersistentState {
            current_term: 0,
            voted_for: None,
            snapshot_state: Some(initial_state),
            snapshot_config: Some(ComplexConfig::single(initial_config)),
            log: LogSlice::initial(),
        }
    }

    // Returns the persistent state for a member joining an established
    // cluster. The new member should be added as non-voting and only be
    // promoted once it has received a snapshot.
    pub fn make_join() -> Self {
        PersistentState {
            current_term: 0,
            voted_for: None,
            snapshot_state: None,
            snapshot_config: None,
            log: LogSlice::initial(),
        }
    }

    // Checks the internal consistency of a persistent-state value, e.g. one
    // read back from storage.
    pub fn validate(&self) -> RaftResult<()> {
        if self.snapshot_state.is_some() != self.snapshot_config.is_some() {
            return Err(RaftError::InvalidState(
                "snapshot state and config must be present together".to_string(),
            ));
        }

        let mut previous_term = self.log.prev_term;
        for (index, entry) in self.log.iter() {
            if entry.term < previous_term {
                return Err(RaftError::InvalidState(format!(
                    "term decreases at index {}",
                    index
                )));
            }
            previous_term = entry.term;
        }
        if previous_term > self.current_term {
            return Err(RaftError::InvalidState(format!(
                "log term {} exceeds current term {}",
                previous_term, self.current_term
            )));
        }

        Ok(())
    }
}

// How a member stores data on disk. `write_persistent_state` returns only
// once the supplied value is durably flushed; the value it stored will be
// handed back to the `Member` constructor after a restart.
//
// If writing the full state ever becomes a bottleneck, a partial-update
// variant for log appends would be the thing to add.
#[async_trait]
pub trait Storage<S: StateMachine>: Send + Sync {
    async fn write_persistent_state(
        &self,
        state: &PersistentState<S>,
        cancel: &Cancel,
    ) -> RaftResult<()>;
}
