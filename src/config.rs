use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use uuid::Uuid;

use crate::assignment::{AssignmentStrategy, BalancedRangeStrategy};
use crate::coordinator::GroupCoordinator;
use crate::error::ConsumerError;
use crate::fetcher::FetchClient;
use crate::metadata::MetadataService;
use crate::types::FailedDecision;
use crate::worker::WorkerStrategy;
use crate::worker_manager::{WorkerFailedAttemptCallback, WorkerFailureCallback};

/// Where to start consuming a partition that has no committed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoOffsetReset {
    /// Start from the earliest retained offset.
    SmallestOffset,
    /// Start from the head of the partition.
    LargestOffset,
}

impl FromStr for AutoOffsetReset {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "smallest" | "earliest" => Ok(AutoOffsetReset::SmallestOffset),
            "largest" | "latest" => Ok(AutoOffsetReset::LargestOffset),
            other => Err(ConsumerError::InvalidConfig(format!(
                "unknown offset reset policy '{other}'"
            ))),
        }
    }
}

/// Full configuration surface for one consumer process.
///
/// Collaborator handles and the strategy/failure hooks are function and
/// trait-object values supplied by the application; everything else has
/// defaults that `EnvSettings` can override from the environment.
#[derive(Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub consumer_id: String,

    pub num_fetchers: usize,
    pub num_workers: usize,
    pub fetch_batch_size: usize,
    pub fetch_batch_timeout: Duration,
    /// Batches buffered per partition between fetcher and worker manager.
    /// A full buffer blocks the fetcher (backpressure), it never drops.
    pub queued_batches: usize,
    pub auto_offset_reset: AutoOffsetReset,

    pub fetch_max_retries: usize,
    pub fetch_retry_backoff: Duration,
    pub commit_interval: Duration,
    pub commit_max_retries: usize,
    pub commit_retry_backoff: Duration,
    pub rebalance_max_retries: usize,
    pub rebalance_retry_backoff: Duration,
    /// How long a released pipeline may drain in-flight tasks before it is
    /// torn down forcibly.
    pub drain_grace_period: Duration,

    pub strategy: WorkerStrategy,
    pub worker_failure_callback: WorkerFailureCallback,
    pub worker_failed_attempt_callback: WorkerFailedAttemptCallback,
    pub assignment_strategy: Arc<dyn AssignmentStrategy>,

    pub coordinator: Arc<dyn GroupCoordinator>,
    pub fetch_client: Arc<dyn FetchClient>,
    pub metadata: Arc<dyn MetadataService>,
}

impl ConsumerConfig {
    /// Build a config with library defaults. The failure callbacks default
    /// to `DoNotCommitOffsetAndStop`: a consumer that has not opted into a
    /// failure policy halts rather than silently skipping messages.
    pub fn new(
        group_id: impl Into<String>,
        strategy: WorkerStrategy,
        coordinator: Arc<dyn GroupCoordinator>,
        fetch_client: Arc<dyn FetchClient>,
        metadata: Arc<dyn MetadataService>,
    ) -> Self {
        let group_id = group_id.into();
        Self {
            consumer_id: format!("{group_id}-{}", Uuid::new_v4()),
            group_id,
            num_fetchers: 1,
            num_workers: 4,
            fetch_batch_size: 100,
            fetch_batch_timeout: Duration::from_millis(250),
            queued_batches: 5,
            auto_offset_reset: AutoOffsetReset::LargestOffset,
            fetch_max_retries: 5,
            fetch_retry_backoff: Duration::from_millis(100),
            commit_interval: Duration::from_millis(500),
            commit_max_retries: 5,
            commit_retry_backoff: Duration::from_millis(100),
            rebalance_max_retries: 8,
            rebalance_retry_backoff: Duration::from_millis(250),
            drain_grace_period: Duration::from_secs(5),
            strategy,
            worker_failure_callback: Arc::new(|_| FailedDecision::DoNotCommitOffsetAndStop),
            worker_failed_attempt_callback: Arc::new(|_, _| {
                FailedDecision::DoNotCommitOffsetAndStop
            }),
            assignment_strategy: Arc::new(BalancedRangeStrategy),
            coordinator,
            fetch_client,
            metadata,
        }
    }

    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self
    }

    pub fn with_num_fetchers(mut self, n: usize) -> Self {
        self.num_fetchers = n;
        self
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn with_fetch_batch(mut self, size: usize, timeout: Duration) -> Self {
        self.fetch_batch_size = size;
        self.fetch_batch_timeout = timeout;
        self
    }

    pub fn with_offset_reset(mut self, policy: AutoOffsetReset) -> Self {
        self.auto_offset_reset = policy;
        self
    }

    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    pub fn with_failed_attempt_callback(mut self, cb: WorkerFailedAttemptCallback) -> Self {
        self.worker_failed_attempt_callback = cb;
        self
    }

    pub fn with_failure_callback(mut self, cb: WorkerFailureCallback) -> Self {
        self.worker_failure_callback = cb;
        self
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.group_id.is_empty() {
            return Err(ConsumerError::InvalidConfig("group_id is empty".to_string()));
        }
        if self.consumer_id.is_empty() {
            return Err(ConsumerError::InvalidConfig(
                "consumer_id is empty".to_string(),
            ));
        }
        if self.num_fetchers == 0 {
            return Err(ConsumerError::InvalidConfig(
                "num_fetchers must be at least 1".to_string(),
            ));
        }
        if self.num_workers == 0 {
            return Err(ConsumerError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.fetch_batch_size == 0 {
            return Err(ConsumerError::InvalidConfig(
                "fetch_batch_size must be at least 1".to_string(),
            ));
        }
        if self.queued_batches == 0 {
            return Err(ConsumerError::InvalidConfig(
                "queued_batches must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("group_id", &self.group_id)
            .field("consumer_id", &self.consumer_id)
            .field("num_fetchers", &self.num_fetchers)
            .field("num_workers", &self.num_workers)
            .field("fetch_batch_size", &self.fetch_batch_size)
            .field("fetch_batch_timeout", &self.fetch_batch_timeout)
            .field("queued_batches", &self.queued_batches)
            .field("auto_offset_reset", &self.auto_offset_reset)
            .field("commit_interval", &self.commit_interval)
            .field("drain_grace_period", &self.drain_grace_period)
            .finish_non_exhaustive()
    }
}

/// Environment-variable overrides for the scalar configuration subset.
#[derive(Envconfig, Clone, Debug)]
pub struct EnvSettings {
    #[envconfig(from = "CONSUMER_NUM_FETCHERS", default = "1")]
    pub num_fetchers: usize,

    #[envconfig(from = "CONSUMER_NUM_WORKERS", default = "4")]
    pub num_workers: usize,

    #[envconfig(from = "CONSUMER_FETCH_BATCH_SIZE", default = "100")]
    pub fetch_batch_size: usize,

    #[envconfig(from = "CONSUMER_FETCH_BATCH_TIMEOUT_MS", default = "250")]
    pub fetch_batch_timeout_ms: u64,

    #[envconfig(from = "CONSUMER_OFFSET_RESET", default = "largest")]
    pub auto_offset_reset: String,

    #[envconfig(from = "CONSUMER_COMMIT_INTERVAL_MS", default = "500")]
    pub commit_interval_ms: u64,

    #[envconfig(from = "CONSUMER_DRAIN_GRACE_PERIOD_SECS", default = "5")]
    pub drain_grace_period_secs: u64,
}

impl EnvSettings {
    pub fn apply(&self, config: &mut ConsumerConfig) -> Result<(), ConsumerError> {
        config.num_fetchers = self.num_fetchers;
        config.num_workers = self.num_workers;
        config.fetch_batch_size = self.fetch_batch_size;
        config.fetch_batch_timeout = Duration::from_millis(self.fetch_batch_timeout_ms);
        config.auto_offset_reset = self.auto_offset_reset.parse()?;
        config.commit_interval = Duration::from_millis(self.commit_interval_ms);
        config.drain_grace_period = Duration::from_secs(self.drain_grace_period_secs);
        config.validate()
    }
}
