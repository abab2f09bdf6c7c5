// End-to-end scenarios running whole clusters against the in-process test
// fabric: elections, replication, snapshot catch-up, leader failover, and
// joint-consensus membership changes.

use std::sync::Arc;
use std::time::Duration;

use accord::testing::{test_options, wait_for, MemStorage, TestCluster};
use accord::{Cancel, Config, Member, MemberId, Mode};

const WAIT: Duration = Duration::from_secs(10);
const LONG_WAIT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn all_applied(cluster: &TestCluster, ids: &[MemberId], expected: &[u64]) -> bool {
    for id in ids {
        let member = cluster.member(*id);
        if member.observe_state_machine().borrow().applied != expected {
            return false;
        }
    }
    true
}

#[tokio::test]
async fn test_single_member_cluster_elects_and_commits() {
    init_tracing();
    let cluster = TestCluster::launch(1, test_options()).await;

    // With a voting set of one, the member elects itself after the first
    // timeout and commits without talking to anyone.
    let leader = cluster.wait_for_leader(WAIT).await;
    let index = leader
        .propose_change(42, &Cancel::never())
        .await
        .expect("propose");
    assert!(index >= 1);

    wait_for(WAIT, || async {
        leader.observe_state_machine().borrow().applied == vec![42]
    })
    .await
    .expect("change applied");

    let status = leader.status().await;
    assert_eq!(status.mode, Mode::Leader);
    assert_eq!(status.last_applied, status.commit_index);
    cluster.check_invariants().await;
}

#[tokio::test]
async fn test_three_member_happy_path() {
    init_tracing();
    let cluster = TestCluster::launch(3, test_options()).await;

    for change in [1, 2, 3] {
        cluster.must_propose(change, WAIT).await;
    }

    // All three members converge on the same log and applied state.
    let ids: Vec<MemberId> = cluster.members.iter().map(|m| m.id()).collect();
    wait_for(WAIT, || async {
        all_applied(&cluster, &ids, &[1, 2, 3]).await
    })
    .await
    .expect("cluster converged");

    let leader = cluster.wait_for_leader(WAIT).await;
    for member in &cluster.members {
        let status = member.status().await;
        assert_eq!(status.commit_index, status.last_applied);
        assert_eq!(member.leader(), leader.id());
    }
    cluster.check_invariants().await;
}

#[tokio::test]
async fn test_follower_catches_up_via_snapshot() {
    init_tracing();
    let cluster = TestCluster::launch(3, test_options()).await;
    let leader = cluster.wait_for_leader(WAIT).await;

    // Partition one follower and build up history without it.
    let victim = cluster
        .members
        .iter()
        .find(|m| m.id() != leader.id())
        .expect("follower")
        .clone();
    cluster.router.disconnect(victim.id());

    for change in 1..=900u64 {
        cluster.must_propose(change, WAIT).await;
    }
    let survivors: Vec<Arc<Member<_>>> = cluster
        .members
        .iter()
        .filter(|m| m.id() != victim.id())
        .cloned()
        .collect();
    wait_for(LONG_WAIT, || async {
        for member in &survivors {
            if member.observe_state_machine().borrow().applied.len() != 900 {
                return false;
            }
        }
        true
    })
    .await
    .expect("survivors applied everything");

    // Compact every live member: whichever of them leads from here on, the
    // log prefix is gone and catching up requires a snapshot.
    let mut anchor = 0;
    for member in &survivors {
        anchor = member.compact_log(&Cancel::never()).await.expect("compact");
        assert!(anchor > 900);
    }

    for change in 901..=1000u64 {
        cluster.must_propose(change, WAIT).await;
    }
    wait_for(LONG_WAIT, || async {
        leader.observe_state_machine().borrow().applied.len() == 1000
    })
    .await
    .expect("leader applied the tail");

    // The reconnected follower is behind the compaction point, so catching
    // up takes an InstallSnapshot followed by ordinary appends.
    cluster.router.reconnect(victim.id());
    let expected: Vec<u64> = (1..=1000).collect();
    wait_for(LONG_WAIT, || async {
        victim.observe_state_machine().borrow().applied == expected
    })
    .await
    .expect("victim caught up");
    assert!(victim.status().await.log_prev_index >= anchor);

    cluster.check_invariants().await;
}

#[tokio::test]
async fn test_leader_failure_triggers_new_election() {
    init_tracing();
    let cluster = TestCluster::launch(3, test_options()).await;

    let first = cluster.must_propose(1, WAIT).await;
    let ids: Vec<MemberId> = cluster.members.iter().map(|m| m.id()).collect();
    wait_for(WAIT, || async { all_applied(&cluster, &ids, &[1]).await })
        .await
        .expect("first change replicated");
    let first_term = first.status().await.term;

    // Kill the leader. The two survivors still form a quorum and elect a
    // replacement at a higher term.
    cluster.router.disconnect(first.id());
    let mut second = None;
    for _ in 0..1000 {
        for member in &cluster.members {
            if member.id() == first.id() {
                continue;
            }
            let status = member.status().await;
            if status.mode == Mode::Leader && status.term > first_term {
                second = Some(member.clone());
            }
        }
        if second.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let second = second.expect("no new leader elected");

    // The new leader keeps accepting proposals.
    second
        .propose_change(2, &Cancel::never())
        .await
        .expect("propose");
    let survivors: Vec<MemberId> = ids.iter().cloned().filter(|id| *id != first.id()).collect();
    wait_for(WAIT, || async {
        all_applied(&cluster, &survivors, &[1, 2]).await
    })
    .await
    .expect("second change replicated");

    cluster.check_invariants().await;
}

#[tokio::test]
async fn test_joint_consensus_reconfiguration() {
    init_tracing();
    let mut cluster = TestCluster::launch(3, test_options()).await;

    let leader = cluster.must_propose(1, WAIT).await;
    let original: Vec<MemberId> = cluster.members.iter().map(|m| m.id()).collect();
    wait_for(WAIT, || async {
        all_applied(&cluster, &original, &[1]).await
    })
    .await
    .expect("initial change replicated");

    // Compact every member so that the joiners receive their state as a
    // snapshot, no matter who leads when they first get contacted.
    for member in &cluster.members {
        member.compact_log(&Cancel::never()).await.expect("compact");
    }

    let d = cluster.add_joiner().await;
    let e = cluster.add_joiner().await;
    assert!(!d.is_initialized());
    assert!(!e.is_initialized());

    // Move from the original three members to {retained, d, e}, where the
    // leader is deliberately not retained.
    let retained = cluster
        .members
        .iter()
        .find(|m| {
            m.id() != leader.id() && m.id() != d.id() && m.id() != e.id()
        })
        .expect("retained member")
        .clone();
    let new_config = Config::with_voters(vec![retained.id(), d.id(), e.id()]);
    leader
        .propose_config_change(new_config, &Cancel::never())
        .await
        .expect("reconfigure");

    // Both phases complete: the old leader, excluded from the final
    // configuration, steps down, and a member of the new voting set takes
    // over.
    let new_ids = [retained.id(), d.id(), e.id()];
    wait_for(LONG_WAIT, || async {
        if leader.status().await.mode != Mode::Follower {
            return false;
        }
        for id in &new_ids {
            let status = cluster.member(*id).status().await;
            if status.mode == Mode::Leader {
                return true;
            }
        }
        false
    })
    .await
    .expect("reconfiguration completed");

    // The joiners received snapshots and now hold real state.
    assert!(d.is_initialized());
    assert!(e.is_initialized());

    // The narrowed cluster keeps serving proposals; the removed members
    // stay inert followers.
    let new_leader = cluster.wait_for_leader(WAIT).await;
    assert!(new_ids.contains(&new_leader.id()));
    new_leader
        .propose_change(2, &Cancel::never())
        .await
        .expect("propose");
    wait_for(LONG_WAIT, || async {
        all_applied(&cluster, &new_ids, &[1, 2]).await
    })
    .await
    .expect("new cluster converged");

    for id in original {
        if id == retained.id() {
            continue;
        }
        assert_eq!(cluster.member(id).status().await.mode, Mode::Follower);
    }
    cluster.check_invariants().await;
}

#[tokio::test]
async fn test_even_cluster_breaks_ties() {
    init_tracing();

    // Four members with near-synchronized timers invite split votes; the
    // randomized timeout redraw on every round breaks them within a few
    // rounds.
    let cluster = TestCluster::launch(4, test_options()).await;
    let leader = cluster.wait_for_leader(WAIT).await;
    assert!(leader.status().await.term >= 1);

    cluster.must_propose(7, WAIT).await;
    let ids: Vec<MemberId> = cluster.members.iter().map(|m| m.id()).collect();
    wait_for(WAIT, || async { all_applied(&cluster, &ids, &[7]).await })
        .await
        .expect("cluster converged");
    cluster.check_invariants().await;
}

#[tokio::test]
async fn test_restart_from_persistent_state() {
    init_tracing();
    let mut cluster = TestCluster::launch(3, test_options()).await;

    let leader = cluster.must_propose(1, WAIT).await;
    cluster.must_propose(2, WAIT).await;
    let ids: Vec<MemberId> = cluster.members.iter().map(|m| m.id()).collect();
    wait_for(WAIT, || async { all_applied(&cluster, &ids, &[1, 2]).await })
        .await
        .expect("changes replicated");

    // Take a follower down and bring it back from what storage last saw.
    let victim = cluster
        .members
        .iter()
        .find(|m| m.id() != leader.id())
        .expect("follower")
        .clone();
    let victim_id = victim.id();
    victim.stop().await;
    cluster.router.unregister(victim_id);

    let storage: Arc<MemStorage<_>> = cluster.storages[&victim_id].clone();
    let stored = storage.read().expect("persisted state");
    stored.validate().expect("stored state is consistent");

    let network = Arc::new(cluster.router.handle(victim_id));
    let restarted = Arc::new(
        Member::new(victim_id, storage, network, stored, test_options()).expect("restart"),
    );
    cluster.router.register(restarted.clone());
    restarted.start().await;

    // Every restart begins in follower mode.
    assert_eq!(restarted.status().await.mode, Mode::Follower);

    let position = cluster
        .members
        .iter()
        .position(|m| m.id() == victim_id)
        .expect("member slot");
    cluster.members[position] = restarted.clone();

    // The restarted member reapplies its log and keeps up with new traffic.
    cluster.must_propose(3, WAIT).await;
    wait_for(LONG_WAIT, || async {
        restarted.observe_state_machine().borrow().applied == vec![1, 2, 3]
    })
    .await
    .expect("restarted member caught up");

    cluster.check_invariants().await;
}
