use std::time::Duration;

use thiserror::Error;

use crate::types::{Partition, TaskId};

/// Errors returned by the fetch client collaborator.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Retryable transport failure; the fetcher backs off and retries.
    #[error("transport error fetching {partition}: {reason}")]
    Transport { partition: Partition, reason: String },

    /// Requested offset is outside the partition's retained range.
    #[error("offset {offset} out of range for {partition} (valid {low}..{high})")]
    OffsetOutOfRange {
        partition: Partition,
        offset: i64,
        low: i64,
        high: i64,
    },

    #[error("unknown topic or partition {partition}")]
    UnknownPartition { partition: Partition },

    #[error("failed to decode batch for {partition}: {reason}")]
    Codec { partition: Partition, reason: String },
}

impl FetchError {
    /// Tag used for metrics labels.
    pub fn error_type(&self) -> &'static str {
        match self {
            FetchError::Transport { .. } => "transport",
            FetchError::OffsetOutOfRange { .. } => "offset_out_of_range",
            FetchError::UnknownPartition { .. } => "unknown_partition",
            FetchError::Codec { .. } => "codec",
        }
    }

    /// Transport blips are retried in place; everything else surfaces as a
    /// fatal partition error and triggers reassignment.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport { .. })
    }
}

/// Errors returned by the group coordination service collaborator.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode coordination value: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors returned by the metadata service collaborator.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("metadata service unavailable: {0}")]
    Unavailable(String),

    #[error("unknown topic {0}")]
    UnknownTopic(String),
}

/// Top-level error taxonomy surfaced by the consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// Claim contention persisted past the bounded rebalance retries.
    #[error("could not claim {partition} for group {group}: held by {owner}")]
    OwnershipConflict {
        group: String,
        partition: Partition,
        owner: String,
    },

    /// A commit kept failing after bounded retries and policy said stop.
    #[error("offset commit for {partition} failed permanently")]
    Commit {
        partition: Partition,
        #[source]
        source: CoordinationError,
    },

    /// A fetch kept failing after bounded retries.
    #[error("fetch for {partition} failed permanently")]
    Fetch {
        partition: Partition,
        #[source]
        source: FetchError,
    },

    /// The failure policy returned a stop decision for a task.
    #[error("worker manager stopped by failure policy on task {task}")]
    PolicyStop { task: TaskId },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("close did not complete within {0:?}; shutdown was forced")]
    CloseTimeout(Duration),
}

impl ConsumerError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ConsumerError::Coordination(_) => "coordination",
            ConsumerError::Metadata(_) => "metadata",
            ConsumerError::OwnershipConflict { .. } => "ownership_conflict",
            ConsumerError::Commit { .. } => "commit",
            ConsumerError::Fetch { .. } => "fetch",
            ConsumerError::PolicyStop { .. } => "policy_stop",
            ConsumerError::InvalidConfig(_) => "invalid_config",
            ConsumerError::CloseTimeout(_) => "close_timeout",
        }
    }
}

/// Fatal notification from a fetcher or worker manager to the rebalance
/// coordinator: the named partition's pipeline can no longer make progress
/// and must be released (and potentially reassigned).
#[derive(Debug)]
pub struct PipelineFailure {
    pub partition: Partition,
    pub error: ConsumerError,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> Partition {
        Partition::new("events".to_string(), 0)
    }

    #[test]
    fn fetch_error_retryability() {
        let transport = FetchError::Transport {
            partition: partition(),
            reason: "connection reset".to_string(),
        };
        assert!(transport.is_retryable());
        assert_eq!(transport.error_type(), "transport");

        let out_of_range = FetchError::OffsetOutOfRange {
            partition: partition(),
            offset: 99,
            low: 0,
            high: 10,
        };
        assert!(!out_of_range.is_retryable());
    }

    #[test]
    fn consumer_error_wraps_sources() {
        let err = ConsumerError::Commit {
            partition: partition(),
            source: CoordinationError::Unavailable("down".to_string()),
        };
        assert_eq!(err.error_type(), "commit");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn coordination_error_converts() {
        let err: ConsumerError = CoordinationError::Unavailable("down".to_string()).into();
        assert_eq!(err.error_type(), "coordination");
    }
}
