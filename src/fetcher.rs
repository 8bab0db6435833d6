//! Fetchers pull batches from the log and feed the per-partition worker
//! managers. Each fetcher owns a disjoint subset of the assigned partitions
//! and round-robins fetch requests across them; a full manager input blocks
//! the fetcher rather than dropping a batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::backoff::retry_delay;
use crate::config::AutoOffsetReset;
use crate::error::{ConsumerError, FetchError, PipelineFailure};
use crate::message::Message;
use crate::metrics_consts::{FETCHER_BATCHES_DELIVERED, FETCHER_FETCH_ERRORS};
use crate::types::Partition;

/// Fetch client collaborator: the wire-level interface to the broker
/// cluster. Given a position and size/time bounds it returns an ordered
/// batch, already decompressed.
#[async_trait]
pub trait FetchClient: Send + Sync + 'static {
    /// Fetch up to `max_messages` starting at `offset`, waiting at most
    /// `max_wait` for data to appear. An empty vec means the wait elapsed
    /// with nothing to return.
    async fn fetch(
        &self,
        partition: &Partition,
        offset: i64,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<Message>, FetchError>;

    /// (low, high) watermarks: earliest retained offset and the offset one
    /// past the newest message.
    async fn watermarks(&self, partition: &Partition) -> Result<(i64, i64), FetchError>;
}

/// One partition's route from the fetcher into its worker manager.
pub(crate) struct PartitionFeed {
    pub partition: Partition,
    pub next_offset: i64,
    pub input: mpsc::Sender<Vec<Message>>,
    failures: usize,
}

impl PartitionFeed {
    pub fn new(partition: Partition, next_offset: i64, input: mpsc::Sender<Vec<Message>>) -> Self {
        Self {
            partition,
            next_offset,
            input,
            failures: 0,
        }
    }
}

pub(crate) struct Fetcher {
    pub id: usize,
    pub client: Arc<dyn FetchClient>,
    pub feeds: Vec<PartitionFeed>,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_retries: usize,
    pub retry_backoff: Duration,
    pub auto_offset_reset: AutoOffsetReset,
    pub failure_tx: mpsc::UnboundedSender<PipelineFailure>,
    pub shutdown: watch::Receiver<bool>,
}

const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(5);

impl Fetcher {
    pub async fn run(self) {
        let Fetcher {
            id,
            client,
            mut feeds,
            batch_size,
            batch_timeout,
            max_retries,
            retry_backoff,
            auto_offset_reset,
            failure_tx,
            mut shutdown,
        } = self;

        info!(fetcher = id, partitions = feeds.len(), "fetcher started");

        'run: while !*shutdown.borrow() {
            if feeds.is_empty() {
                // Nothing left to poll; wait for teardown.
                if shutdown.changed().await.is_err() {
                    break;
                }
                continue;
            }

            let mut idx = 0;
            while idx < feeds.len() {
                if *shutdown.borrow() {
                    break 'run;
                }

                let feed = &mut feeds[idx];
                let fetched = tokio::select! {
                    res = client.fetch(&feed.partition, feed.next_offset, batch_size, batch_timeout) => res,
                    _ = shutdown.changed() => break 'run,
                };

                match fetched {
                    Ok(batch) if batch.is_empty() => {
                        feed.failures = 0;
                        idx += 1;
                    }
                    Ok(batch) => {
                        feed.failures = 0;
                        debug!(
                            fetcher = id,
                            partition = %feed.partition,
                            first_offset = batch.first().map(|m| m.offset),
                            count = batch.len(),
                            "delivering batch"
                        );
                        feed.next_offset = batch.last().map(|m| m.offset + 1).unwrap_or(feed.next_offset);
                        metrics::counter!(FETCHER_BATCHES_DELIVERED).increment(1);

                        // Await capacity in the manager input: backpressure,
                        // never drop. Only shutdown interrupts the send.
                        let send = tokio::select! {
                            res = feed.input.send(batch) => res,
                            _ = shutdown.changed() => break 'run,
                        };
                        if send.is_err() {
                            // Manager gone; its pipeline is being torn down.
                            feeds.remove(idx);
                            continue;
                        }
                        idx += 1;
                    }
                    Err(FetchError::OffsetOutOfRange { low, high, .. }) => {
                        // The checkpointed position fell out of retention.
                        // Re-seek per the configured reset policy.
                        let reset_to = match auto_offset_reset {
                            AutoOffsetReset::SmallestOffset => low,
                            AutoOffsetReset::LargestOffset => high,
                        };
                        warn!(
                            fetcher = id,
                            partition = %feed.partition,
                            stale_offset = feed.next_offset,
                            reset_to,
                            "offset out of range, applying reset policy"
                        );
                        feed.next_offset = reset_to;
                        idx += 1;
                    }
                    Err(e) if e.is_retryable() && feed.failures < max_retries => {
                        feed.failures += 1;
                        metrics::counter!(FETCHER_FETCH_ERRORS, "error_type" => e.error_type())
                            .increment(1);
                        let delay = retry_delay(retry_backoff, feed.failures - 1, RETRY_BACKOFF_CAP);
                        warn!(
                            fetcher = id,
                            partition = %feed.partition,
                            failures = feed.failures,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "fetch failed, backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => break 'run,
                        }
                    }
                    Err(e) => {
                        metrics::counter!(FETCHER_FETCH_ERRORS, "error_type" => e.error_type())
                            .increment(1);
                        warn!(
                            fetcher = id,
                            partition = %feed.partition,
                            error = %e,
                            "fetch failed permanently, releasing partition"
                        );
                        let failed = feeds.remove(idx);
                        drop(failure_tx.send(PipelineFailure {
                            partition: failed.partition.clone(),
                            error: ConsumerError::Fetch {
                                partition: failed.partition,
                                source: e,
                            },
                        }));
                    }
                }
            }
        }

        info!(fetcher = id, "fetcher shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{produce_n, InMemoryCluster};
    use tokio::time::timeout;

    fn feed_for(
        partition: Partition,
        offset: i64,
        capacity: usize,
    ) -> (PartitionFeed, mpsc::Receiver<Vec<Message>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (PartitionFeed::new(partition, offset, tx), rx)
    }

    fn fetcher(
        client: Arc<dyn FetchClient>,
        feeds: Vec<PartitionFeed>,
    ) -> (
        Fetcher,
        watch::Sender<bool>,
        mpsc::UnboundedReceiver<PipelineFailure>,
    ) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let fetcher = Fetcher {
            id: 0,
            client,
            feeds,
            batch_size: 10,
            batch_timeout: Duration::from_millis(20),
            max_retries: 2,
            retry_backoff: Duration::from_millis(5),
            auto_offset_reset: AutoOffsetReset::SmallestOffset,
            failure_tx,
            shutdown: shutdown_rx,
        };
        (fetcher, shutdown_tx, failure_rx)
    }

    #[tokio::test]
    async fn delivers_batches_in_offset_order() {
        let cluster = InMemoryCluster::new();
        cluster.create_topic("t", 1);
        produce_n(&cluster, "t", 25);

        let partition = Partition::new("t".to_string(), 0);
        let (feed, mut rx) = feed_for(partition, 0, 8);
        let (fetcher, shutdown_tx, _failures) = fetcher(cluster.fetch_client(), vec![feed]);
        let handle = tokio::spawn(fetcher.run());

        let mut seen = Vec::new();
        while seen.len() < 25 {
            let batch = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for batch")
                .expect("feed closed early");
            seen.extend(batch.into_iter().map(|m| m.offset));
        }
        assert_eq!(seen, (0..25).collect::<Vec<i64>>());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn backpressure_blocks_without_dropping() {
        let cluster = InMemoryCluster::new();
        cluster.create_topic("t", 1);
        produce_n(&cluster, "t", 50);

        let partition = Partition::new("t".to_string(), 0);
        // Capacity 1: the fetcher must stall once the buffer is full.
        let (feed, mut rx) = feed_for(partition, 0, 1);
        let (fetcher, shutdown_tx, _failures) = fetcher(cluster.fetch_client(), vec![feed]);
        let handle = tokio::spawn(fetcher.run());

        // Do not consume for a while; the fetcher must not drop anything.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut seen = Vec::new();
        while seen.len() < 50 {
            let batch = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for batch")
                .expect("feed closed early");
            seen.extend(batch.into_iter().map(|m| m.offset));
        }
        assert_eq!(seen, (0..50).collect::<Vec<i64>>());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    mockall::mock! {
        FetchSource {}

        #[async_trait]
        impl FetchClient for FetchSource {
            async fn fetch(
                &self,
                partition: &Partition,
                offset: i64,
                max_messages: usize,
                max_wait: Duration,
            ) -> Result<Vec<Message>, FetchError>;

            async fn watermarks(&self, partition: &Partition) -> Result<(i64, i64), FetchError>;
        }
    }

    #[tokio::test]
    async fn transport_errors_retry_then_report_fatal() {
        let mut client = MockFetchSource::new();
        // max_retries retries plus the final fatal attempt
        client
            .expect_fetch()
            .times(3)
            .returning(|partition, _, _, _| {
                Err(FetchError::Transport {
                    partition: partition.clone(),
                    reason: "connection refused".to_string(),
                })
            });

        let partition = Partition::new("t".to_string(), 0);
        let (feed, _rx) = feed_for(partition.clone(), 0, 1);
        let (fetcher, shutdown_tx, mut failures) = fetcher(Arc::new(client), vec![feed]);
        let handle = tokio::spawn(fetcher.run());

        let failure = timeout(Duration::from_secs(2), failures.recv())
            .await
            .expect("timed out waiting for failure")
            .expect("failure channel closed");
        assert_eq!(failure.partition, partition);
        assert!(matches!(failure.error, ConsumerError::Fetch { .. }));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn out_of_range_applies_reset_policy() {
        let cluster = InMemoryCluster::new();
        cluster.create_topic("t", 1);
        produce_n(&cluster, "t", 5);

        let partition = Partition::new("t".to_string(), 0);
        // Start far past the high watermark; policy resets to smallest.
        let (feed, mut rx) = feed_for(partition, 99, 4);
        let (fetcher, shutdown_tx, _failures) = fetcher(cluster.fetch_client(), vec![feed]);
        let handle = tokio::spawn(fetcher.run());

        let batch = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for batch")
            .expect("feed closed early");
        assert_eq!(batch.first().map(|m| m.offset), Some(0));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
