use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// A logical election epoch. Terms increase monotonically and are never
/// reused; at most one leader exists per term.
pub type Term = u64;

/// A position in the logical, infinite log. Indices start at 1; index 0 is
/// a sentinel meaning "before the log".
pub type Index = u64;

/// Identifies one member of a Raft cluster. The Raft paper uses small
/// integers; we use UUIDs because members get their identity assigned
/// before the cluster exists, so there is no distributed way to hand out
/// consecutive numbers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Returns a fresh, globally unique member id.
    pub fn new_random() -> Self {
        MemberId(Uuid::new_v4())
    }

    /// The nil sentinel, used to express "no leader known".
    pub fn nil() -> Self {
        MemberId(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // The first uuid group is plenty to tell members apart in logs.
        let text = self.0.as_simple().to_string();
        write!(f, "{}", &text[..8])
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}
