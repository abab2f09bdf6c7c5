use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

// The replicated state machine managed by the Raft cluster. The consensus
// implementation applies committed changes in log order, exactly once, on
// every member; snapshots of the state are shipped to members that have
// fallen behind the compaction point.
//
// Both the state and its change type are plain values: cheap to clone,
// comparable, and serializable so that the storage collaborator can write
// them out and the network collaborator can ship them inside RPCs.
pub trait StateMachine:
    Clone + Debug + Default + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    // The operation type stored in regular log entries.
    type Change: Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static;

    // Applies the change to the state, mutating it in place. Application is
    // infallible; a change that can be rejected must encode the rejection in
    // the state itself so all members agree on it.
    fn apply_change(&mut self, change: &Self::Change);
}
