use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::ComplexConfig;
use crate::state_machine::StateMachine;
use crate::types::{Index, Term};

// The payload of a log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: StateMachine")]
pub enum EntryPayload<S: StateMachine> {
    // Carries a state-machine change.
    Regular(S::Change),

    // Carries a cluster configuration; used for membership changes as
    // described in Section 6 of the Raft paper. Configurations take effect
    // for quorum purposes as soon as they are appended.
    Configuration(ComplexConfig),

    // Carries nothing. Appended by a freshly elected leader so that entries
    // from previous terms can be committed indirectly (Raft paper,
    // Section 8).
    NoOp,
}

// An entry in the Raft log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: StateMachine")]
pub struct LogEntry<S: StateMachine> {
    pub term: Term,
    pub payload: EntryPayload<S>,
}

// A contiguous slice of the Raft log, anchored at the entry immediately
// before it. This shows up in two places: in an AppendEntries RPC, where
// `prev_index` and `prev_term` are the parameters Figure 2 of the Raft
// paper calls `prevLogIndex` and `prevLogTerm`, and in each member's local
// state, where they are the "last included index" and "last included term"
// of the snapshot (Section 7).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: StateMachine")]
pub struct LogSlice<S: StateMachine> {
    pub prev_index: Index,
    pub prev_term: Term,
    entries: VecDeque<LogEntry<S>>,
}

impl<S: StateMachine> LogSlice<S> {
    // Returns an empty slice anchored at the given position.
    pub fn new(prev_index: Index, prev_term: Term) -> Self {
        LogSlice {
            prev_index,
            prev_term,
            entries: VecDeque::new(),
        }
    }

    // Returns an empty slice representing the beginning of time, i.e., the
    // next expected entry has index 1.
    pub fn initial() -> Self {
        Self::new(0, 0)
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    // Returns the latest index present in the slice. If the slice is empty,
    // this is the index the slice is anchored on.
    pub fn latest_index(&self) -> Index {
        self.prev_index + self.entries.len() as u64
    }

    // Returns the term of the latest entry, falling back to the anchor.
    pub fn latest_term(&self) -> Term {
        self.term_at(self.latest_index())
    }

    // Returns the term of the entry at the given index. The index must be
    // either present in the slice or the anchor position itself.
    pub fn term_at(&self, index: Index) -> Term {
        assert!(index >= self.prev_index, "the log doesn't go back this far");
        assert!(
            index <= self.latest_index(),
            "the log doesn't go forward this far"
        );
        if index == self.prev_index {
            self.prev_term
        } else {
            self.entry_at(index).term
        }
    }

    // Returns the entry at the given index, which must be present.
    pub fn entry_at(&self, index: Index) -> &LogEntry<S> {
        assert!(index > self.prev_index, "the log doesn't go back this far");
        assert!(
            index <= self.latest_index(),
            "the log doesn't go forward this far"
        );
        &self.entries[(index - self.prev_index - 1) as usize]
    }

    // Adds an entry to the end of the slice and returns its index.
    pub fn append(&mut self, entry: LogEntry<S>) -> Index {
        assert!(
            entry.term >= self.latest_term(),
            "terms must be nondecreasing"
        );
        self.entries.push_back(entry);
        self.latest_index()
    }

    // Deletes the entry at the given index and all entries after it.
    pub fn truncate_suffix_from(&mut self, index: Index) {
        assert!(index > self.prev_index, "the log doesn't go back this far");
        assert!(
            index <= self.latest_index(),
            "the log doesn't go forward this far"
        );
        self.entries.truncate((index - self.prev_index - 1) as usize);
    }

    // Deletes the entry at the given index and all entries before it,
    // re-anchoring the slice at that position.
    pub fn truncate_prefix_to(&mut self, index: Index) {
        assert!(index > self.prev_index, "the log doesn't go back this far");
        assert!(
            index <= self.latest_index(),
            "the log doesn't go forward this far"
        );
        let index_term = self.term_at(index);
        self.entries.drain(..(index - self.prev_index) as usize);
        self.prev_index = index;
        self.prev_term = index_term;
    }

    // Returns a slice holding all entries from `start` onwards, anchored at
    // `start - 1`. The anchor must be covered by this slice.
    pub fn slice_from(&self, start: Index) -> LogSlice<S> {
        assert!(start > self.prev_index, "the log doesn't go back this far");
        assert!(
            start <= self.latest_index() + 1,
            "the log doesn't go forward this far"
        );
        let mut result = LogSlice::new(start - 1, self.term_at(start - 1));
        for index in start..=self.latest_index() {
            result.entries.push_back(self.entry_at(index).clone());
        }
        result
    }

    // Returns true if a log whose last entry has the supplied term and index
    // is at least as up-to-date as this one (Raft paper, Section 5.4.1).
    pub fn is_up_to_date(&self, other_last_term: Term, other_last_index: Index) -> bool {
        if other_last_term != self.latest_term() {
            return other_last_term > self.latest_term();
        }
        other_last_index >= self.latest_index()
    }

    // Returns the latest configuration entry in the slice, with its index.
    pub fn latest_config(&self) -> Option<(Index, &ComplexConfig)> {
        self.config_at_or_below(self.latest_index())
    }

    // Returns the latest configuration entry at or below the given index.
    pub fn config_at_or_below(&self, upper: Index) -> Option<(Index, &ComplexConfig)> {
        let mut index = upper.min(self.latest_index());
        while index > self.prev_index {
            if let EntryPayload::Configuration(config) = &self.entry_at(index).payload {
                return Some((index, config));
            }
            index -= 1;
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (Index, &LogEntry<S>)> {
        let first = self.prev_index + 1;
        self.entries
            .iter()
            .enumerate()
            .map(move |(offset, entry)| (first + offset as u64, entry))
    }
}
