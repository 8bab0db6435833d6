mod common;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{counting_strategy, test_env, wait_until, TestEnv};
use kafka_group_consumer::test_utils::produce_n;
use kafka_group_consumer::{
    Consumer, ConsumerHandle, DeploymentTarget, GroupCoordinator, RebalanceState, WorkerResult,
    WorkerStrategy,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

type ConsumerTask = JoinHandle<Result<(), kafka_group_consumer::ConsumerError>>;

fn start_member(
    env: &TestEnv,
    group: &str,
    consumer_id: &str,
    topic: &str,
    strategy: WorkerStrategy,
) -> (ConsumerHandle, ConsumerTask) {
    let config = env.config(group, strategy).with_consumer_id(consumer_id);
    let consumer = Consumer::new(config).expect("valid config");
    let handle = consumer.handle();
    let topic = topic.to_string();
    let join = tokio::spawn(consumer.start_static(HashMap::from([(topic, 1)])));
    (handle, join)
}

/// Count partitions of `topic` in `group` owned by each consumer id.
fn owner_counts(
    env: &TestEnv,
    group: &str,
    topic: &str,
    partitions: i32,
) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for p in 0..partitions {
        if let Some(owner) = env.coordinator.partition_owner(group, topic, p) {
            *counts.entry(owner).or_insert(0) += 1;
        }
    }
    counts
}

#[tokio::test(flavor = "multi_thread")]
async fn partitions_split_evenly_and_fail_over() -> Result<()> {
    let env = test_env();
    env.cluster.create_topic("failover", 4);

    let consumed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(std::collections::HashSet::new()));
    let duplicate = Arc::new(AtomicBool::new(false));
    let strategy: WorkerStrategy = {
        let consumed = consumed.clone();
        let seen = seen.clone();
        let duplicate = duplicate.clone();
        Arc::new(move |_, msg, id| {
            let value = String::from_utf8_lossy(&msg.value).to_string();
            if !seen.lock().unwrap().insert(value) {
                duplicate.store(true, Ordering::SeqCst);
            }
            consumed.fetch_add(1, Ordering::SeqCst);
            WorkerResult::Success(id.clone())
        })
    };

    let (h0, j0) = start_member(&env, "failover-group", "c-0", "failover", strategy.clone());
    let (mut h1, j1) = start_member(&env, "failover-group", "c-1", "failover", strategy);

    assert!(h1.wait_for_state(RebalanceState::Owning, SETTLE_TIMEOUT).await);
    wait_until("even partition split", SETTLE_TIMEOUT, || {
        let counts = owner_counts(&env, "failover-group", "failover", 4);
        counts.get("c-0") == Some(&2) && counts.get("c-1") == Some(&2)
    })
    .await;

    produce_n(&env.cluster, "failover", 40);
    wait_until("first batch consumed", SETTLE_TIMEOUT, || {
        consumed.load(Ordering::SeqCst) == 40
    })
    .await;

    // One member leaves; the survivor must claim all four partitions and
    // keep draining without loss or duplication.
    h1.close(CLOSE_TIMEOUT).await?;
    j1.await??;

    wait_until("survivor owns everything", SETTLE_TIMEOUT, || {
        let counts = owner_counts(&env, "failover-group", "failover", 4);
        counts.get("c-0") == Some(&4)
    })
    .await;

    produce_n(&env.cluster, "failover", 40);
    wait_until("second batch consumed", SETTLE_TIMEOUT, || {
        consumed.load(Ordering::SeqCst) == 80
    })
    .await;

    assert!(
        !duplicate.load(Ordering::SeqCst),
        "a message was delivered twice"
    );

    h0.close(CLOSE_TIMEOUT).await?;
    j0.await??;

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_starts_converge_to_exclusive_ownership() -> Result<()> {
    let env = test_env();
    env.cluster.create_topic("contended", 6);

    let mut handles = Vec::new();
    for i in 0..3 {
        let consumed = Arc::new(AtomicUsize::new(0));
        let (handle, join) = start_member(
            &env,
            "contended-group",
            &format!("c-{i}"),
            "contended",
            counting_strategy(consumed),
        );
        handles.push((handle, join));
    }

    // All three race their initial rebalances; the deterministic assignment
    // plus claim retries must settle on exactly two partitions each.
    wait_until("exclusive balanced ownership", SETTLE_TIMEOUT, || {
        let counts = owner_counts(&env, "contended-group", "contended", 6);
        counts.len() == 3 && counts.values().all(|&n| n == 2)
    })
    .await;

    for (handle, join) in handles {
        handle.close(CLOSE_TIMEOUT).await?;
        join.await??;
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn blue_green_deployment_swaps_groups_and_topics() -> Result<()> {
    let env = test_env();
    env.cluster.create_topic("active", 2);
    env.cluster.create_topic("inactive", 2);

    let counted_by_blue = Arc::new(AtomicUsize::new(0));
    let counted_by_green = Arc::new(AtomicUsize::new(0));

    let mut members = Vec::new();
    for i in 0..2 {
        members.push(start_member(
            &env,
            "blue-group",
            &format!("blue-{i}"),
            "active",
            counting_strategy(counted_by_blue.clone()),
        ));
    }
    for i in 0..2 {
        members.push(start_member(
            &env,
            "green-group",
            &format!("green-{i}"),
            "inactive",
            counting_strategy(counted_by_green.clone()),
        ));
    }

    wait_until("both groups own their topics", SETTLE_TIMEOUT, || {
        owner_counts(&env, "blue-group", "active", 2).values().sum::<usize>() == 2
            && owner_counts(&env, "green-group", "inactive", 2)
                .values()
                .sum::<usize>()
                == 2
    })
    .await;

    env.coordinator
        .request_deployment_swap(
            DeploymentTarget::new("blue-group", "active"),
            DeploymentTarget::new("green-group", "inactive"),
        )
        .await
        .unwrap();

    // The request clears once every member of either group has applied it.
    wait_until("swap acknowledged by all members", SETTLE_TIMEOUT, || {
        !env.coordinator.has_pending_swap()
    })
    .await;

    // Membership records swapped sides.
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let in_blue = env
            .coordinator
            .consumers_in_group("blue-group")
            .await
            .unwrap();
        let in_green = env
            .coordinator
            .consumers_in_group("green-group")
            .await
            .unwrap();
        if in_blue == vec!["green-0", "green-1"] && in_green == vec!["blue-0", "blue-1"] {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "groups never swapped membership: blue={in_blue:?} green={in_green:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Ownership followed: former green members drain the active topic under
    // the blue group id, former blue members drain inactive under green.
    wait_until("swapped ownership settles", SETTLE_TIMEOUT, || {
        let blue_side = owner_counts(&env, "blue-group", "active", 2);
        let green_side = owner_counts(&env, "green-group", "inactive", 2);
        blue_side.keys().all(|o| o.starts_with("green-"))
            && blue_side.values().sum::<usize>() == 2
            && green_side.keys().all(|o| o.starts_with("blue-"))
            && green_side.values().sum::<usize>() == 2
    })
    .await;

    // Messages produced after the swap window land with the group now
    // draining each topic; none are lost.
    produce_n(&env.cluster, "active", 10);
    produce_n(&env.cluster, "inactive", 10);

    wait_until("post-swap messages consumed", SETTLE_TIMEOUT, || {
        counted_by_green.load(Ordering::SeqCst) == 10
            && counted_by_blue.load(Ordering::SeqCst) == 10
    })
    .await;

    for (handle, join) in members {
        handle.close(CLOSE_TIMEOUT).await?;
        join.await??;
    }

    Ok(())
}
