//! High-level consumer-group client for Kafka-style partitioned logs.
//!
//! Application code subscribes to topics by name or pattern; the client
//! discovers partitions, distributes them across the cooperating processes
//! of a consumer group through an external coordination service, pulls
//! batches from each owned partition, dispatches them to a user-supplied
//! strategy with per-partition ordering and backpressure, and commits
//! offsets only past a contiguous prefix of terminal results.
//!
//! The broker wire protocol, the coordination service itself, and topic
//! administration are collaborators behind the [`FetchClient`],
//! [`GroupCoordinator`], and [`MetadataService`] traits; in-memory
//! implementations for tests live in [`test_utils`].

pub mod assignment;
mod backoff;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod message;
pub mod metadata;
pub mod metrics_consts;
pub mod rebalance;
pub mod types;
pub mod worker;
pub mod worker_manager;

// Used in "mod tests" and the tests/ directory (integration tests)
pub mod test_utils;

pub use config::{AutoOffsetReset, ConsumerConfig, EnvSettings};
pub use consumer::{Consumer, ConsumerHandle};
pub use coordinator::{
    BlueGreenRequest, ClaimOutcome, DeploymentTarget, GroupCoordinator, GroupEvent, Subscription,
};
pub use error::{ConsumerError, CoordinationError, FetchError, MetadataError};
pub use fetcher::FetchClient;
pub use message::Message;
pub use metadata::{MetadataService, TopicFilter};
pub use rebalance::RebalanceState;
pub use types::{FailedDecision, Partition, Task, TaskId, WorkerResult};
pub use worker::{WorkerContext, WorkerStrategy};
pub use worker_manager::{ManagerContext, WorkerFailedAttemptCallback, WorkerFailureCallback};
