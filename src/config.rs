use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::MemberId;

// Describes the set of members that participate in the cluster. Voting
// members count towards quorum; non-voting members receive log updates but
// have no say in elections or commitment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub voting_members: BTreeSet<MemberId>,
    pub non_voting_members: BTreeSet<MemberId>,
}

impl Config {
    // Convenience constructor for a configuration where everyone votes.
    pub fn with_voters<I: IntoIterator<Item = MemberId>>(voters: I) -> Self {
        Config {
            voting_members: voters.into_iter().collect(),
            non_voting_members: BTreeSet::new(),
        }
    }

    // Returns all members, voting and non-voting.
    pub fn all_members(&self) -> BTreeSet<MemberId> {
        let mut members = self.voting_members.clone();
        members.extend(self.non_voting_members.iter().cloned());
        members
    }

    // Returns true if the supplied members constitute a majority of the
    // voting set.
    pub fn is_quorum(&self, members: &BTreeSet<MemberId>) -> bool {
        let votes = members
            .iter()
            .filter(|m| self.voting_members.contains(m))
            .count();
        votes * 2 > self.voting_members.len()
    }

    // Returns true if the given member can act as a leader.
    pub fn is_valid_leader(&self, member: MemberId) -> bool {
        self.voting_members.contains(&member)
    }
}

// Either a single configuration, or a joint consensus of an old and a new
// configuration as described in Section 6 of the Raft paper. For a regular
// configuration `config` holds the configuration and `new_config` is empty;
// for joint consensus `config` holds the old one and `new_config` the new
// one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexConfig {
    pub config: Config,
    pub new_config: Option<Config>,
}

impl ComplexConfig {
    pub fn single(config: Config) -> Self {
        ComplexConfig {
            config,
            new_config: None,
        }
    }

    pub fn joint(old: Config, new: Config) -> Self {
        ComplexConfig {
            config: old,
            new_config: Some(new),
        }
    }

    pub fn is_joint_consensus(&self) -> bool {
        self.new_config.is_some()
    }

    // Raft paper, Section 6: "Log entries are replicated to all servers in
    // both configurations."
    pub fn all_members(&self) -> BTreeSet<MemberId> {
        let mut members = self.config.all_members();
        if let Some(new_config) = &self.new_config {
            members.extend(new_config.all_members());
        }
        members
    }

    // All members that may cast votes, on either side of a joint consensus.
    pub fn all_voting_members(&self) -> BTreeSet<MemberId> {
        let mut members = self.config.voting_members.clone();
        if let Some(new_config) = &self.new_config {
            members.extend(new_config.voting_members.iter().cloned());
        }
        members
    }

    // Raft paper, Section 6: "Agreement (for elections and entry commitment)
    // requires separate majorities from both the old and new configurations."
    pub fn is_quorum(&self, members: &BTreeSet<MemberId>) -> bool {
        match &self.new_config {
            Some(new_config) => self.config.is_quorum(members) && new_config.is_quorum(members),
            None => self.config.is_quorum(members),
        }
    }

    // Raft paper, Section 6: "Any server from either configuration may serve
    // as leader."
    pub fn is_valid_leader(&self, member: MemberId) -> bool {
        self.config.is_valid_leader(member)
            || self
                .new_config
                .as_ref()
                .map(|c| c.is_valid_leader(member))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<MemberId> {
        (0..n).map(|_| MemberId::new_random()).collect()
    }

    fn set(members: &[MemberId]) -> BTreeSet<MemberId> {
        members.iter().cloned().collect()
    }

    #[test]
    fn test_quorum_simple_majority() {
        let m = ids(3);
        let config = Config::with_voters(m.clone());

        assert!(!config.is_quorum(&set(&[])));
        assert!(!config.is_quorum(&set(&[m[0]])));
        assert!(config.is_quorum(&set(&[m[0], m[1]])));
        assert!(config.is_quorum(&set(&[m[0], m[1], m[2]])));
    }

    #[test]
    fn test_quorum_ignores_outsiders() {
        let m = ids(3);
        let outsider = MemberId::new_random();
        let config = Config::with_voters(m.clone());

        assert!(!config.is_quorum(&set(&[m[0], outsider])));
        assert!(config.is_quorum(&set(&[m[0], m[1], outsider])));
    }

    #[test]
    fn test_quorum_ignores_non_voting() {
        let m = ids(4);
        let mut config = Config::with_voters(m[..3].to_vec());
        config.non_voting_members.insert(m[3]);

        // The non-voting member never counts towards the majority.
        assert!(!config.is_quorum(&set(&[m[0], m[3]])));
        assert!(config.is_quorum(&set(&[m[0], m[1], m[3]])));
    }

    #[test]
    fn test_single_member_quorum() {
        let m = ids(1);
        let config = Config::with_voters(m.clone());
        assert!(config.is_quorum(&set(&[m[0]])));
        assert!(!config.is_quorum(&set(&[])));
    }

    #[test]
    fn test_valid_leader() {
        let m = ids(2);
        let mut config = Config::with_voters(vec![m[0]]);
        config.non_voting_members.insert(m[1]);

        assert!(config.is_valid_leader(m[0]));
        assert!(!config.is_valid_leader(m[1]));
        assert!(!config.is_valid_leader(MemberId::new_random()));
    }

    #[test]
    fn test_joint_quorum_needs_both_sides() {
        // Old config {a, b, c}, new config {c, d, e}.
        let m = ids(5);
        let old = Config::with_voters(vec![m[0], m[1], m[2]]);
        let new = Config::with_voters(vec![m[2], m[3], m[4]]);
        let joint = ComplexConfig::joint(old, new);

        // Majority of the old side alone is not enough.
        assert!(!joint.is_quorum(&set(&[m[0], m[1]])));

        // Majority of the new side alone is not enough.
        assert!(!joint.is_quorum(&set(&[m[3], m[4]])));

        // Majorities of both sides at once.
        assert!(joint.is_quorum(&set(&[m[0], m[2], m[3]])));
        assert!(joint.is_quorum(&set(&[m[1], m[2], m[4]])));
    }

    #[test]
    fn test_joint_leader_from_either_side() {
        let m = ids(4);
        let old = Config::with_voters(vec![m[0], m[1]]);
        let new = Config::with_voters(vec![m[2], m[3]]);
        let joint = ComplexConfig::joint(old, new);

        for member in &m {
            assert!(joint.is_valid_leader(*member));
        }
        assert!(!joint.is_valid_leader(MemberId::new_random()));
    }

    #[test]
    fn test_joint_membership_is_union() {
        let m = ids(4);
        let old = Config::with_voters(vec![m[0], m[1]]);
        let new = Config::with_voters(vec![m[1], m[2], m[3]]);
        let joint = ComplexConfig::joint(old, new);

        assert_eq!(joint.all_members(), set(&m));
        assert_eq!(joint.all_voting_members(), set(&m));
    }

    #[test]
    fn test_single_config_passthrough() {
        let m = ids(3);
        let single = ComplexConfig::single(Config::with_voters(m.clone()));

        assert!(!single.is_joint_consensus());
        assert!(single.is_quorum(&set(&[m[0], m[1]])));
        assert!(single.is_valid_leader(m[0]));
    }
}
