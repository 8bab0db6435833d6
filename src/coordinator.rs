//! Interface to the external group coordination service.
//!
//! The coordination service is the single source of truth for group
//! membership, partition ownership, and offset checkpoints. Consumers never
//! cache ownership across rebalances; every claim goes through here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::CoordinationError;

/// What a registered consumer is subscribed to, stored in its ephemeral
/// membership record so group members can detect subscription drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topics: Vec<String>,
}

impl Subscription {
    pub fn new(mut topics: Vec<String>) -> Self {
        topics.sort();
        Self { topics }
    }
}

/// One side of a blue-green deployment swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub group: String,
    pub topic: String,
}

impl DeploymentTarget {
    pub fn new(group: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            topic: topic.into(),
        }
    }
}

/// Operator-issued instruction for two groups to swap the topics they
/// drain. Consumed once by every member of either group, then cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueGreenRequest {
    pub id: String,
    pub blue: DeploymentTarget,
    pub green: DeploymentTarget,
}

impl BlueGreenRequest {
    /// For a consumer in `group`, the target it must switch to: members of
    /// the blue group take over the green side and vice versa. Returns
    /// `None` when the request does not address `group`.
    pub fn counterpart(&self, group: &str) -> Option<&DeploymentTarget> {
        if self.blue.group == group {
            Some(&self.green)
        } else if self.green.group == group {
            Some(&self.blue)
        } else {
            None
        }
    }
}

/// Events delivered on a group watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// A consumer joined or left the group.
    MembershipChanged,
    /// A blue-green swap addressing this group was posted.
    DeploymentRequested(BlueGreenRequest),
}

/// Result of a partition ownership claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another consumer currently holds the claim. Expected transient
    /// contention during concurrent rebalances, not an error.
    AlreadyOwned(String),
}

/// Group coordination service collaborator.
///
/// Offsets stored here are "next offset to consume" checkpoints: a
/// committed value of N means everything below N is processed.
#[async_trait]
pub trait GroupCoordinator: Send + Sync + 'static {
    async fn register_consumer(
        &self,
        group: &str,
        consumer: &str,
        subscription: &Subscription,
    ) -> Result<(), CoordinationError>;

    async fn deregister_consumer(&self, group: &str, consumer: &str)
        -> Result<(), CoordinationError>;

    /// Live consumer ids in the group, in ascending order. The ordering is
    /// part of the contract: assignment determinism depends on every member
    /// seeing the same sequence.
    async fn consumers_in_group(&self, group: &str) -> Result<Vec<String>, CoordinationError>;

    /// Subscribe to membership and deployment events for a group.
    async fn watch_group(
        &self,
        group: &str,
    ) -> Result<mpsc::UnboundedReceiver<GroupEvent>, CoordinationError>;

    async fn claim_partition(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        owner: &str,
    ) -> Result<ClaimOutcome, CoordinationError>;

    /// Release a claim held by `owner`. Releasing a partition not held by
    /// `owner` is a no-op.
    async fn release_partition(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        owner: &str,
    ) -> Result<(), CoordinationError>;

    /// Last committed checkpoint, or `None` when the group has never
    /// committed this partition.
    async fn fetch_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>, CoordinationError>;

    async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), CoordinationError>;

    /// Post a blue-green swap request addressing two (group, topic) pairs.
    async fn request_deployment_swap(
        &self,
        blue: DeploymentTarget,
        green: DeploymentTarget,
    ) -> Result<(), CoordinationError>;

    /// Acknowledge that `consumer` has applied the swap. The service clears
    /// the request once every affected consumer has acknowledged it.
    async fn acknowledge_deployment_swap(
        &self,
        request_id: &str,
        consumer: &str,
    ) -> Result<(), CoordinationError>;
}
