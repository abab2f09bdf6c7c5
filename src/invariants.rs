use std::collections::BTreeMap;

use crate::member::{MemberInner, Mode};
use crate::state_machine::StateMachine;
use crate::types::{MemberId, Term};

// Side-effect-free audits of member state. Violations indicate a bug in the
// consensus implementation, not a runtime condition, so they are fatal.
//
// `check_member` inspects one member and runs at every lock boundary;
// `check_cluster` inspects a set of members whose mutexes the caller holds
// and asserts the cross-member Raft safety properties.

pub(crate) fn check_member<S: StateMachine>(member: &MemberInner<S>) {
    if let Err(e) = member.ps.validate() {
        panic!("member {}: {}", member.id, e);
    }

    let log = &member.ps.log;
    assert!(
        member.commit_index >= log.prev_index,
        "member {}: commit index {} behind snapshot point {}",
        member.id,
        member.commit_index,
        log.prev_index
    );
    assert!(
        member.commit_index <= log.latest_index(),
        "member {}: commit index {} ahead of log end {}",
        member.id,
        member.commit_index,
        log.latest_index()
    );
    assert!(
        member.last_applied <= member.commit_index,
        "member {}: applied {} ahead of commit {}",
        member.id,
        member.last_applied,
        member.commit_index
    );
    assert!(
        member.last_applied >= log.prev_index,
        "member {}: applied {} behind snapshot point {}",
        member.id,
        member.last_applied,
        log.prev_index
    );

    if member.ps.snapshot_config.is_none() {
        // A member that knows no configuration is waiting for its first
        // snapshot and must stay passive.
        assert_eq!(
            member.mode,
            Mode::Follower,
            "member {}: uninitialized member in mode {:?}",
            member.id,
            member.mode
        );
    }

    if member.mode == Mode::Leader {
        assert_eq!(
            member.ps.voted_for,
            Some(member.id),
            "member {}: leader without its own vote",
            member.id
        );
        assert_eq!(
            member.current_term_leader_id, member.id,
            "member {}: leader acknowledging someone else",
            member.id
        );
        // During the second phase of a reconfiguration the leader may
        // already be excluded from the appended final configuration; it
        // keeps leading until that configuration commits (Raft paper,
        // Section 6).
        assert!(
            member.effective_config().is_valid_leader(member.id)
                || member.committed_config().is_valid_leader(member.id),
            "member {}: leading without being a valid leader",
            member.id
        );
    }
}

pub(crate) fn check_cluster<S: StateMachine>(members: &[&MemberInner<S>]) {
    check_election_safety(members);
    check_log_matching(members);
    check_applied_state_agreement(members);
    check_leader_completeness(members);
}

// At most one leader exists per term.
fn check_election_safety<S: StateMachine>(members: &[&MemberInner<S>]) {
    let mut leaders: BTreeMap<Term, MemberId> = BTreeMap::new();
    for member in members {
        if member.mode != Mode::Leader {
            continue;
        }
        if let Some(existing) = leaders.insert(member.ps.current_term, member.id) {
            assert_eq!(
                existing, member.id,
                "two leaders in term {}: {} and {}",
                member.ps.current_term, existing, member.id
            );
        }
    }
}

// If two members hold an entry at the same index with the same term, their
// logs are identical up to that index. Committed entries additionally agree
// between every pair, regardless of terms matching above.
fn check_log_matching<S: StateMachine>(members: &[&MemberInner<S>]) {
    for (position, a) in members.iter().enumerate() {
        for b in &members[position + 1..] {
            let low = a.ps.log.prev_index.max(b.ps.log.prev_index);
            let high = a.ps.log.latest_index().min(b.ps.log.latest_index());
            if high <= low {
                continue;
            }

            let mut matched_above = false;
            for index in ((low + 1)..=high).rev() {
                let term_a = a.ps.log.term_at(index);
                let term_b = b.ps.log.term_at(index);
                if term_a == term_b {
                    assert_eq!(
                        a.ps.log.entry_at(index),
                        b.ps.log.entry_at(index),
                        "members {} and {} disagree at index {} despite equal terms",
                        a.id,
                        b.id,
                        index
                    );
                    matched_above = true;
                } else {
                    assert!(
                        !matched_above,
                        "log matching violated between {} and {} at index {}",
                        a.id, b.id, index
                    );
                }
            }

            let committed_high = a.commit_index.min(b.commit_index).min(high);
            for index in (low + 1)..=committed_high {
                assert_eq!(
                    a.ps.log.term_at(index),
                    b.ps.log.term_at(index),
                    "members {} and {} disagree on committed index {}",
                    a.id,
                    b.id,
                    index
                );
            }
        }
    }
}

// Members that have applied the same prefix hold identical states.
fn check_applied_state_agreement<S: StateMachine>(members: &[&MemberInner<S>]) {
    for (position, a) in members.iter().enumerate() {
        for b in &members[position + 1..] {
            if !a.is_initialized() || !b.is_initialized() {
                continue;
            }
            if a.last_applied == b.last_applied {
                assert_eq!(
                    a.state_machine, b.state_machine,
                    "members {} and {} applied {} entries but disagree on the state",
                    a.id, b.id, a.last_applied
                );
            }
        }
    }
}

// Every entry committed anywhere is present in the log of the leader with
// the highest term.
fn check_leader_completeness<S: StateMachine>(members: &[&MemberInner<S>]) {
    let leader = members
        .iter()
        .filter(|m| m.mode == Mode::Leader)
        .max_by_key(|m| m.ps.current_term);
    let leader = match leader {
        Some(leader) => leader,
        None => return,
    };

    for member in members {
        if member.ps.current_term > leader.ps.current_term {
            // The member knows of a term the leader hasn't seen; the leader
            // is about to be deposed and owes nothing to entries committed
            // beyond its term.
            continue;
        }
        let low = member.ps.log.prev_index.max(leader.ps.log.prev_index);
        let high = member.commit_index.min(member.ps.log.latest_index());
        for index in (low + 1)..=high {
            assert!(
                leader.ps.log.latest_index() >= index,
                "leader {} is missing committed index {} held by {}",
                leader.id,
                index,
                member.id
            );
            assert_eq!(
                leader.ps.log.term_at(index),
                member.ps.log.term_at(index),
                "leader {} disagrees with {} on committed index {}",
                leader.id,
                member.id,
                index
            );
        }
    }
}
