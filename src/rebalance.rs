//! Rebalance coordination: computes partition assignment across the live
//! group membership and drives the claim/release protocol against the
//! coordination service.
//!
//! The state machine loops `Idle → Rebalancing → Owning` on every trigger
//! (membership change, topic metadata change, blue-green request, pipeline
//! failure) and reaches the terminal `Stopped` state on shutdown. Claim
//! contention with racing group members is expected and retried from a
//! fresh membership read, never surfaced as an error until the bounded
//! retries run out.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::assignment::partitions_for;
use crate::backoff::retry_delay;
use crate::config::{AutoOffsetReset, ConsumerConfig};
use crate::coordinator::{ClaimOutcome, GroupEvent, Subscription};
use crate::error::{ConsumerError, CoordinationError, MetadataError, PipelineFailure};
use crate::fetcher::{Fetcher, PartitionFeed};
use crate::metadata::TopicFilter;
use crate::metrics_consts::{CLAIM_CONFLICTS, OWNED_PARTITIONS, REBALANCES_TOTAL};
use crate::types::Partition;
use crate::worker_manager::WorkerManager;

/// Extra time allowed for a pipeline task to finish its own bounded drain
/// before it is aborted outright.
const JOIN_MARGIN: Duration = Duration::from_secs(2);
const REBALANCE_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// What this consumer is subscribed to.
#[derive(Clone, Debug)]
pub(crate) enum SubscriptionSpec {
    /// Fixed topic set with a per-topic stream (fetch pipeline) count.
    Static(HashMap<String, usize>),
    /// Pattern-matched topic set, re-evaluated on every rebalance trigger.
    Wildcard { filter: TopicFilter, streams: usize },
}

impl SubscriptionSpec {
    /// The current target topics with their stream counts, sorted by name.
    async fn resolve(
        &self,
        metadata: &dyn crate::metadata::MetadataService,
    ) -> Result<Vec<(String, usize)>, ConsumerError> {
        let mut topics = match self {
            SubscriptionSpec::Static(map) => {
                map.iter().map(|(t, s)| (t.clone(), *s)).collect::<Vec<_>>()
            }
            SubscriptionSpec::Wildcard { filter, streams } => {
                let known = metadata.topics().await?;
                filter
                    .select(&known)
                    .into_iter()
                    .map(|t| (t, *streams))
                    .collect()
            }
        };
        topics.sort();
        Ok(topics)
    }

    /// Rewrite the subscription onto a single topic, preserving the stream
    /// count. Used when a blue-green swap moves this consumer onto the
    /// paired group's topic.
    fn retarget(&self, topic: &str) -> SubscriptionSpec {
        let streams = match self {
            SubscriptionSpec::Static(map) => map.values().copied().max().unwrap_or(1),
            SubscriptionSpec::Wildcard { streams, .. } => *streams,
        };
        SubscriptionSpec::Static(HashMap::from([(topic.to_string(), streams)]))
    }
}

/// Observable lifecycle of the rebalance coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceState {
    Idle,
    Rebalancing,
    Owning,
    Stopped,
}

struct PipelineTask {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PipelineTask {
    async fn stop(self, grace: Duration, what: &str) {
        let _ = self.shutdown_tx.send(true);
        let mut join = self.join;
        match timeout(grace, &mut join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = what, error = %e, "pipeline task panicked"),
            Err(_) => {
                warn!(task = what, "pipeline task did not stop within grace, aborting");
                join.abort();
                drop(join.await);
            }
        }
    }
}

pub(crate) struct RebalanceCoordinator {
    config: ConsumerConfig,
    group_id: String,
    subscription: SubscriptionSpec,
    owned: Vec<Partition>,
    managers: Vec<PipelineTask>,
    fetchers: Vec<PipelineTask>,
    /// Swap request ids already applied; a redelivered request must not
    /// swap this consumer back.
    applied_swaps: HashSet<String>,
    failure_tx: mpsc::UnboundedSender<PipelineFailure>,
    failure_rx: mpsc::UnboundedReceiver<PipelineFailure>,
    state_tx: watch::Sender<RebalanceState>,
    shutdown: watch::Receiver<bool>,
}

impl RebalanceCoordinator {
    pub fn new(
        config: ConsumerConfig,
        subscription: SubscriptionSpec,
        state_tx: watch::Sender<RebalanceState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let group_id = config.group_id.clone();
        Self {
            config,
            group_id,
            subscription,
            owned: Vec::new(),
            managers: Vec::new(),
            fetchers: Vec::new(),
            applied_swaps: HashSet::new(),
            failure_tx,
            failure_rx,
            state_tx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), ConsumerError> {
        let result = self.run_inner().await;
        if let Err(e) = &result {
            error!(
                group = %self.group_id,
                consumer = %self.config.consumer_id,
                error = %e,
                "rebalance coordinator failed"
            );
        }

        self.stop_pipelines().await;
        self.release_owned().await;
        drop(
            self.config
                .coordinator
                .deregister_consumer(&self.group_id, &self.config.consumer_id)
                .await,
        );
        self.set_state(RebalanceState::Stopped);
        info!(
            group = %self.group_id,
            consumer = %self.config.consumer_id,
            "consumer stopped"
        );
        result
    }

    async fn run_inner(&mut self) -> Result<(), ConsumerError> {
        self.set_state(RebalanceState::Idle);

        // Watch before registering so no membership event can slip between
        // the two; our own join event is coalesced into the initial
        // rebalance below.
        let mut group_events = self
            .config
            .coordinator
            .watch_group(&self.group_id)
            .await?;
        let mut topic_events = self.config.metadata.watch_topics().await?;

        let topics = self.subscription.resolve(self.config.metadata.as_ref()).await?;
        let subscription = Subscription::new(topics.iter().map(|(t, _)| t.clone()).collect());
        self.config
            .coordinator
            .register_consumer(&self.group_id, &self.config.consumer_id, &subscription)
            .await?;
        info!(
            group = %self.group_id,
            consumer = %self.config.consumer_id,
            topics = ?subscription.topics,
            "registered with group"
        );

        let mut pending_rebalance = true;
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            if pending_rebalance {
                // Coalesce the burst: every queued trigger folds into this
                // one rebalance. Deployment swaps still apply individually.
                while let Ok(event) = group_events.try_recv() {
                    if let GroupEvent::DeploymentRequested(request) = event {
                        if self.apply_deployment_swap(request).await? {
                            group_events =
                                self.config.coordinator.watch_group(&self.group_id).await?;
                        }
                    }
                }
                while topic_events.try_recv().is_ok() {}
                while self.failure_rx.try_recv().is_ok() {}

                self.rebalance().await?;
                pending_rebalance = false;
                continue;
            }

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(());
                    }
                }

                event = group_events.recv() => {
                    match event {
                        None => {
                            return Err(CoordinationError::Unavailable(
                                "group watch closed".to_string(),
                            )
                            .into());
                        }
                        Some(GroupEvent::MembershipChanged) => {
                            debug!(group = %self.group_id, "membership changed");
                            pending_rebalance = true;
                        }
                        Some(GroupEvent::DeploymentRequested(request)) => {
                            if self.apply_deployment_swap(request).await? {
                                group_events =
                                    self.config.coordinator.watch_group(&self.group_id).await?;
                                pending_rebalance = true;
                            }
                        }
                    }
                }

                changed = topic_events.recv() => {
                    if changed.is_none() {
                        return Err(MetadataError::Unavailable(
                            "topic watch closed".to_string(),
                        )
                        .into());
                    }
                    debug!(group = %self.group_id, "topic metadata changed");
                    pending_rebalance = true;
                }

                Some(failure) = self.failure_rx.recv() => {
                    warn!(
                        partition = %failure.partition,
                        error = %failure.error,
                        "pipeline failed, releasing and rebalancing"
                    );
                    pending_rebalance = true;
                }
            }
        }
    }

    /// One full pass of the claim/release protocol: tear down, re-read the
    /// world, compute the deterministic assignment, claim our share.
    async fn rebalance(&mut self) -> Result<(), ConsumerError> {
        self.set_state(RebalanceState::Rebalancing);
        metrics::counter!(REBALANCES_TOTAL).increment(1);

        self.stop_pipelines().await;
        self.release_owned().await;

        let coordinator = self.config.coordinator.clone();
        let consumer_id = self.config.consumer_id.clone();

        let mut attempt = 0;
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            let topics = self.subscription.resolve(self.config.metadata.as_ref()).await?;
            let members = coordinator.consumers_in_group(&self.group_id).await?;

            let mut partitions = Vec::new();
            for (topic, _) in &topics {
                let numbers = match self.config.metadata.partitions(topic).await {
                    Ok(numbers) => numbers,
                    Err(MetadataError::UnknownTopic(_)) => {
                        debug!(topic = %topic, "topic not yet known, skipping");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                partitions.extend(
                    numbers
                        .into_iter()
                        .map(|n| Partition::new(topic.clone(), n)),
                );
            }

            let assignments = self
                .config
                .assignment_strategy
                .compute_assignments(&members, &partitions);
            let mine: Vec<Partition> = partitions_for(&assignments, &consumer_id)
                .into_iter()
                .cloned()
                .collect();

            debug!(
                group = %self.group_id,
                members = members.len(),
                partitions = partitions.len(),
                assigned = mine.len(),
                "computed assignment"
            );

            let mut claimed = Vec::new();
            let mut conflict = None;
            for partition in &mine {
                match coordinator
                    .claim_partition(
                        &self.group_id,
                        partition.topic(),
                        partition.partition_number(),
                        &consumer_id,
                    )
                    .await?
                {
                    ClaimOutcome::Claimed => claimed.push(partition.clone()),
                    ClaimOutcome::AlreadyOwned(owner) => {
                        conflict = Some((partition.clone(), owner));
                        break;
                    }
                }
            }

            let Some((partition, owner)) = conflict else {
                self.owned = claimed;
                metrics::gauge!(OWNED_PARTITIONS).set(self.owned.len() as f64);
                self.start_pipelines(&topics).await?;
                self.set_state(RebalanceState::Owning);
                info!(
                    group = %self.group_id,
                    consumer = %consumer_id,
                    owned = self.owned.len(),
                    "rebalance complete"
                );
                return Ok(());
            };

            // Another member still holds a claim we computed as ours;
            // release everything and retry from a fresh membership read.
            metrics::counter!(CLAIM_CONFLICTS).increment(1);
            for p in &claimed {
                drop(
                    coordinator
                        .release_partition(
                            &self.group_id,
                            p.topic(),
                            p.partition_number(),
                            &consumer_id,
                        )
                        .await,
                );
            }

            if attempt >= self.config.rebalance_max_retries {
                return Err(ConsumerError::OwnershipConflict {
                    group: self.group_id.clone(),
                    partition,
                    owner,
                });
            }
            let delay = retry_delay(
                self.config.rebalance_retry_backoff,
                attempt,
                REBALANCE_BACKOFF_CAP,
            );
            debug!(
                group = %self.group_id,
                partition = %partition,
                owner = %owner,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "claim conflict, retrying rebalance"
            );
            attempt += 1;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Start one fetcher/worker-manager pipeline pair per owned partition,
    /// seeded from the last committed checkpoint. Partitions of a topic are
    /// grouped into at most `streams` fetch streams; streams are then
    /// spread round-robin across the configured fetcher count.
    async fn start_pipelines(
        &mut self,
        topics: &[(String, usize)],
    ) -> Result<(), ConsumerError> {
        if self.owned.is_empty() {
            return Ok(());
        }

        let stream_counts: HashMap<&str, usize> = topics
            .iter()
            .map(|(t, s)| (t.as_str(), (*s).max(1)))
            .collect();

        let mut owned = self.owned.clone();
        owned.sort();

        // stream key -> feeds served by that stream
        let mut streams: Vec<Vec<PartitionFeed>> = Vec::new();
        let mut stream_index: HashMap<(String, usize), usize> = HashMap::new();
        let mut topic_position: HashMap<String, usize> = HashMap::new();

        for partition in owned {
            let start_offset = self.resolve_start_offset(&partition).await?;

            let (input_tx, input_rx) = tokio::sync::mpsc::channel(self.config.queued_batches);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let manager = WorkerManager::from_config(
                &self.config,
                partition.clone(),
                start_offset,
                input_rx,
                shutdown_rx,
                self.failure_tx.clone(),
            );
            self.managers.push(PipelineTask {
                shutdown_tx,
                join: manager.spawn(),
            });

            let per_topic_streams = stream_counts
                .get(partition.topic())
                .copied()
                .unwrap_or(1);
            let position = topic_position
                .entry(partition.topic().to_string())
                .or_insert(0);
            let slot = *position % per_topic_streams;
            *position += 1;

            let key = (partition.topic().to_string(), slot);
            let stream = match stream_index.get(&key) {
                Some(&idx) => idx,
                None => {
                    streams.push(Vec::new());
                    stream_index.insert(key, streams.len() - 1);
                    streams.len() - 1
                }
            };
            streams[stream].push(PartitionFeed::new(partition, start_offset, input_tx));
        }

        let num_fetchers = self.config.num_fetchers.min(streams.len()).max(1);
        let mut buckets: Vec<Vec<PartitionFeed>> = (0..num_fetchers).map(|_| Vec::new()).collect();
        for (i, stream) in streams.into_iter().enumerate() {
            buckets[i % num_fetchers].extend(stream);
        }

        for (id, feeds) in buckets.into_iter().enumerate() {
            if feeds.is_empty() {
                continue;
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let fetcher = Fetcher {
                id,
                client: self.config.fetch_client.clone(),
                feeds,
                batch_size: self.config.fetch_batch_size,
                batch_timeout: self.config.fetch_batch_timeout,
                max_retries: self.config.fetch_max_retries,
                retry_backoff: self.config.fetch_retry_backoff,
                auto_offset_reset: self.config.auto_offset_reset,
                failure_tx: self.failure_tx.clone(),
                shutdown: shutdown_rx,
            };
            self.fetchers.push(PipelineTask {
                shutdown_tx,
                join: tokio::spawn(fetcher.run()),
            });
        }

        Ok(())
    }

    async fn resolve_start_offset(&self, partition: &Partition) -> Result<i64, ConsumerError> {
        let checkpoint = self
            .config
            .coordinator
            .fetch_offset(
                &self.group_id,
                partition.topic(),
                partition.partition_number(),
            )
            .await?;
        if let Some(offset) = checkpoint {
            return Ok(offset);
        }

        let (low, high) = self
            .config
            .fetch_client
            .watermarks(partition)
            .await
            .map_err(|e| ConsumerError::Fetch {
                partition: partition.clone(),
                source: e,
            })?;
        Ok(match self.config.auto_offset_reset {
            AutoOffsetReset::SmallestOffset => low,
            AutoOffsetReset::LargestOffset => high,
        })
    }

    /// Stop fetchers first so no new batches enter, then let each manager
    /// drain its in-flight tasks within the grace period.
    async fn stop_pipelines(&mut self) {
        for fetcher in &self.fetchers {
            let _ = fetcher.shutdown_tx.send(true);
        }
        for manager in &self.managers {
            let _ = manager.shutdown_tx.send(true);
        }

        let grace = self.config.drain_grace_period + JOIN_MARGIN;
        join_all(
            self.fetchers
                .drain(..)
                .map(|fetcher| fetcher.stop(grace, "fetcher")),
        )
        .await;
        join_all(
            self.managers
                .drain(..)
                .map(|manager| manager.stop(grace, "worker-manager")),
        )
        .await;
    }

    async fn release_owned(&mut self) {
        for partition in self.owned.drain(..) {
            if let Err(e) = self
                .config
                .coordinator
                .release_partition(
                    &self.group_id,
                    partition.topic(),
                    partition.partition_number(),
                    &self.config.consumer_id,
                )
                .await
            {
                warn!(partition = %partition, error = %e, "failed to release partition");
            }
        }
        metrics::gauge!(OWNED_PARTITIONS).set(0.0);
    }

    /// Apply a blue-green swap addressed to this consumer's group: adopt
    /// the paired group's id and topic, move the membership record, then
    /// acknowledge. Returns false when the request names other groups.
    async fn apply_deployment_swap(
        &mut self,
        request: crate::coordinator::BlueGreenRequest,
    ) -> Result<bool, ConsumerError> {
        let Some(target) = request.counterpart(&self.group_id) else {
            return Ok(false);
        };
        let target = target.clone();
        if !self.applied_swaps.insert(request.id.clone()) {
            return Ok(false);
        }

        info!(
            from_group = %self.group_id,
            to_group = %target.group,
            to_topic = %target.topic,
            "applying blue-green deployment swap"
        );

        // Drain and release under the old group before adopting the new
        // one, so the incoming group's members can claim these partitions.
        self.stop_pipelines().await;
        self.release_owned().await;

        let old_group = std::mem::replace(&mut self.group_id, target.group.clone());
        self.subscription = self.subscription.retarget(&target.topic);

        let coordinator = self.config.coordinator.clone();
        coordinator
            .deregister_consumer(&old_group, &self.config.consumer_id)
            .await?;
        let subscription = Subscription::new(vec![target.topic.clone()]);
        coordinator
            .register_consumer(&self.group_id, &self.config.consumer_id, &subscription)
            .await?;
        coordinator
            .acknowledge_deployment_swap(&request.id, &self.config.consumer_id)
            .await?;

        Ok(true)
    }

    fn set_state(&self, state: RebalanceState) {
        let _ = self.state_tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retarget_static_preserves_stream_count() {
        let spec = SubscriptionSpec::Static(HashMap::from([("old".to_string(), 3)]));
        match spec.retarget("new") {
            SubscriptionSpec::Static(map) => {
                assert_eq!(map.len(), 1);
                assert_eq!(map.get("new"), Some(&3));
            }
            other => panic!("expected static subscription, got {other:?}"),
        }
    }

    #[test]
    fn retarget_wildcard_becomes_static() {
        let spec = SubscriptionSpec::Wildcard {
            filter: TopicFilter::white_list("x-.+").unwrap(),
            streams: 2,
        };
        match spec.retarget("y") {
            SubscriptionSpec::Static(map) => {
                assert_eq!(map.get("y"), Some(&2));
            }
            other => panic!("expected static subscription, got {other:?}"),
        }
    }
}
