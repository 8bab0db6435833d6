//! Shared harness for the integration tests: an in-memory cluster plus
//! coordination service wired into a consumer config with test-friendly
//! timings (small batches, fast commits, short backoffs).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use kafka_group_consumer::test_utils::{InMemoryCluster, InMemoryCoordinator};
use kafka_group_consumer::{
    AutoOffsetReset, ConsumerConfig, WorkerResult, WorkerStrategy,
};
use tokio::time::Instant;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        drop(
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init(),
        );
    });
}

pub struct TestEnv {
    pub cluster: Arc<InMemoryCluster>,
    pub coordinator: Arc<InMemoryCoordinator>,
}

pub fn test_env() -> TestEnv {
    init_tracing();
    TestEnv {
        cluster: InMemoryCluster::new(),
        coordinator: Arc::new(InMemoryCoordinator::new()),
    }
}

impl TestEnv {
    /// Consumer config against this environment with timings tuned for
    /// tests: consume from the beginning, commit fast, retry fast.
    pub fn config(&self, group: &str, strategy: WorkerStrategy) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(
            group,
            strategy,
            self.coordinator.clone(),
            self.cluster.fetch_client(),
            self.cluster.metadata(),
        )
        .with_offset_reset(AutoOffsetReset::SmallestOffset)
        .with_fetch_batch(10, Duration::from_millis(50))
        .with_commit_interval(Duration::from_millis(25));
        config.rebalance_retry_backoff = Duration::from_millis(20);
        config.rebalance_max_retries = 30;
        config.fetch_retry_backoff = Duration::from_millis(10);
        config.commit_retry_backoff = Duration::from_millis(10);
        config.drain_grace_period = Duration::from_secs(2);
        config
    }
}

/// Strategy that counts successful deliveries.
pub fn counting_strategy(counter: Arc<AtomicUsize>) -> WorkerStrategy {
    Arc::new(move |_, _, id| {
        counter.fetch_add(1, Ordering::SeqCst);
        WorkerResult::Success(id.clone())
    })
}

/// Poll until `cond` holds or the deadline passes. Panics on timeout with
/// the given label.
pub async fn wait_until(what: &str, deadline: Duration, mut cond: impl FnMut() -> bool) {
    let end = Instant::now() + deadline;
    while !cond() {
        assert!(Instant::now() < end, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
