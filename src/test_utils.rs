//! In-memory implementations of the three collaborators (fetch client,
//! metadata service, group coordination service), shared by unit and
//! integration tests. They model the interface contracts faithfully:
//! ordered partition logs with long-poll fetch, lazily-formed groups with
//! membership watches, claim exclusivity, and blue-green swap requests
//! that clear once every affected consumer has acknowledged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use crate::coordinator::{
    BlueGreenRequest, ClaimOutcome, DeploymentTarget, GroupCoordinator, GroupEvent, Subscription,
};
use crate::error::{CoordinationError, FetchError, MetadataError};
use crate::fetcher::FetchClient;
use crate::message::Message;
use crate::metadata::MetadataService;
use crate::types::Partition;

/// Compression codec applied to stored payloads. The fetch client decodes
/// transparently, so strategies observe byte-identical payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    None,
    Gzip,
}

struct StoredMessage {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    codec: Codec,
    timestamp: DateTime<Utc>,
}

struct TopicData {
    partitions: Vec<RwLock<Vec<StoredMessage>>>,
    next_partition: AtomicUsize,
}

/// An in-memory broker cluster: topics of ordered, append-only partition
/// logs plus the notification plumbing behind long-poll fetches and topic
/// metadata watches.
pub struct InMemoryCluster {
    topics: RwLock<HashMap<String, Arc<TopicData>>>,
    data_notify: Notify,
    topic_watchers: Mutex<Vec<mpsc::UnboundedSender<()>>>,
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
            data_notify: Notify::new(),
            topic_watchers: Mutex::new(Vec::new()),
        })
    }

    pub fn create_topic(&self, name: &str, partitions: usize) {
        let data = Arc::new(TopicData {
            partitions: (0..partitions).map(|_| RwLock::new(Vec::new())).collect(),
            next_partition: AtomicUsize::new(0),
        });
        self.topics
            .write()
            .expect("topics lock poisoned")
            .insert(name.to_string(), data);
        self.notify_topic_watchers();
    }

    /// Round-robin produce across the topic's partitions.
    pub fn produce(&self, topic: &str, value: &[u8]) {
        self.produce_with(topic, None, value, Codec::None);
    }

    pub fn produce_with(&self, topic: &str, key: Option<&[u8]>, value: &[u8], codec: Codec) {
        let data = self.topic_data(topic).expect("produce to unknown topic");
        let partition = data.next_partition.fetch_add(1, Ordering::SeqCst) % data.partitions.len();
        self.append(&data, partition, key, value, codec);
    }

    pub fn produce_to_partition(&self, topic: &str, partition: usize, value: &[u8]) {
        let data = self.topic_data(topic).expect("produce to unknown topic");
        self.append(&data, partition, None, value, Codec::None);
    }

    fn append(
        &self,
        data: &TopicData,
        partition: usize,
        key: Option<&[u8]>,
        value: &[u8],
        codec: Codec,
    ) {
        let payload = match codec {
            Codec::None => value.to_vec(),
            Codec::Gzip => {
                use std::io::Write;
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(value).expect("gzip encode failed");
                encoder.finish().expect("gzip encode failed")
            }
        };
        data.partitions[partition]
            .write()
            .expect("partition lock poisoned")
            .push(StoredMessage {
                key: key.map(|k| k.to_vec()),
                payload,
                codec,
                timestamp: Utc::now(),
            });
        self.data_notify.notify_waiters();
    }

    fn topic_data(&self, topic: &str) -> Option<Arc<TopicData>> {
        self.topics
            .read()
            .expect("topics lock poisoned")
            .get(topic)
            .cloned()
    }

    fn notify_topic_watchers(&self) {
        self.topic_watchers
            .lock()
            .expect("watchers lock poisoned")
            .retain(|tx| tx.send(()).is_ok());
    }

    pub fn fetch_client(self: &Arc<Self>) -> Arc<dyn FetchClient> {
        Arc::new(InMemoryFetchClient {
            cluster: self.clone(),
        })
    }

    pub fn metadata(self: &Arc<Self>) -> Arc<dyn MetadataService> {
        Arc::new(InMemoryMetadata {
            cluster: self.clone(),
        })
    }
}

/// Produce `n` distinct messages `test-message-0..n` round-robin.
pub fn produce_n(cluster: &InMemoryCluster, topic: &str, n: usize) {
    for i in 0..n {
        cluster.produce(topic, format!("test-message-{i}").as_bytes());
    }
}

struct InMemoryFetchClient {
    cluster: Arc<InMemoryCluster>,
}

impl InMemoryFetchClient {
    fn read_batch(
        &self,
        data: &TopicData,
        partition: &Partition,
        offset: i64,
        max_messages: usize,
    ) -> Result<Vec<Message>, FetchError> {
        let log = data.partitions[partition.partition_number() as usize]
            .read()
            .expect("partition lock poisoned");
        let end = log.len().min(offset as usize + max_messages);
        let mut batch = Vec::with_capacity(end - offset as usize);
        for (i, stored) in log[offset as usize..end].iter().enumerate() {
            let value = match stored.codec {
                Codec::None => stored.payload.clone(),
                Codec::Gzip => {
                    let mut decoder = GzDecoder::new(stored.payload.as_slice());
                    let mut decoded = Vec::new();
                    decoder
                        .read_to_end(&mut decoded)
                        .map_err(|e| FetchError::Codec {
                            partition: partition.clone(),
                            reason: e.to_string(),
                        })?;
                    decoded
                }
            };
            batch.push(Message::new(
                partition.topic().to_string(),
                partition.partition_number(),
                offset + i as i64,
                stored.key.clone(),
                value,
                stored.timestamp,
            ));
        }
        Ok(batch)
    }
}

#[async_trait]
impl FetchClient for InMemoryFetchClient {
    async fn fetch(
        &self,
        partition: &Partition,
        offset: i64,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<Message>, FetchError> {
        let deadline = Instant::now() + max_wait;
        loop {
            // Arm the notification before reading the high watermark so a
            // produce between the read and the wait cannot be missed.
            let notified = self.cluster.data_notify.notified();
            tokio::pin!(notified);

            let Some(data) = self.cluster.topic_data(partition.topic()) else {
                return Err(FetchError::UnknownPartition {
                    partition: partition.clone(),
                });
            };
            let index = partition.partition_number();
            if index < 0 || index as usize >= data.partitions.len() {
                return Err(FetchError::UnknownPartition {
                    partition: partition.clone(),
                });
            }

            let high = data.partitions[index as usize]
                .read()
                .expect("partition lock poisoned")
                .len() as i64;
            if offset < 0 || offset > high {
                return Err(FetchError::OffsetOutOfRange {
                    partition: partition.clone(),
                    offset,
                    low: 0,
                    high,
                });
            }
            if offset < high {
                return self.read_batch(&data, partition, offset, max_messages);
            }

            // Long poll: wait for new data until max_wait elapses.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if timeout(remaining, &mut notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn watermarks(&self, partition: &Partition) -> Result<(i64, i64), FetchError> {
        let Some(data) = self.cluster.topic_data(partition.topic()) else {
            return Err(FetchError::UnknownPartition {
                partition: partition.clone(),
            });
        };
        let index = partition.partition_number();
        if index < 0 || index as usize >= data.partitions.len() {
            return Err(FetchError::UnknownPartition {
                partition: partition.clone(),
            });
        }
        let high = data.partitions[index as usize]
            .read()
            .expect("partition lock poisoned")
            .len() as i64;
        Ok((0, high))
    }
}

struct InMemoryMetadata {
    cluster: Arc<InMemoryCluster>,
}

#[async_trait]
impl MetadataService for InMemoryMetadata {
    async fn topics(&self) -> Result<Vec<String>, MetadataError> {
        let mut names: Vec<String> = self
            .cluster
            .topics
            .read()
            .expect("topics lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, MetadataError> {
        match self.cluster.topic_data(topic) {
            Some(data) => Ok((0..data.partitions.len() as i32).collect()),
            None => Err(MetadataError::UnknownTopic(topic.to_string())),
        }
    }

    async fn watch_topics(&self) -> Result<mpsc::UnboundedReceiver<()>, MetadataError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.cluster
            .topic_watchers
            .lock()
            .expect("watchers lock poisoned")
            .push(tx);
        Ok(rx)
    }
}

struct SwapState {
    request: BlueGreenRequest,
    pending_acks: HashSet<String>,
}

/// In-memory group coordination service. Membership records are removed on
/// deregistration; a departing consumer's claims are released with it,
/// matching the liveness-expiry semantics of a real coordination service.
pub struct InMemoryCoordinator {
    groups: Mutex<HashMap<String, BTreeMap<String, Subscription>>>,
    claims: DashMap<(String, String, i32), String>,
    offsets: DashMap<(String, String, i32), i64>,
    watchers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<GroupEvent>>>>,
    swaps: Mutex<Vec<SwapState>>,
    commit_failures: AtomicUsize,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            claims: DashMap::new(),
            offsets: DashMap::new(),
            watchers: Mutex::new(HashMap::new()),
            swaps: Mutex::new(Vec::new()),
            commit_failures: AtomicUsize::new(0),
        }
    }

    /// Fault injection: the next `n` commit calls fail with `Unavailable`.
    pub fn fail_next_commits(&self, n: usize) {
        self.commit_failures.store(n, Ordering::SeqCst);
    }

    /// Current claim holder, if any. Test helper.
    pub fn partition_owner(&self, group: &str, topic: &str, partition: i32) -> Option<String> {
        self.claims
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|entry| entry.value().clone())
    }

    /// Whether any blue-green request is still awaiting acknowledgements.
    pub fn has_pending_swap(&self) -> bool {
        !self.swaps.lock().expect("swaps lock poisoned").is_empty()
    }

    fn notify_group(&self, group: &str, event: GroupEvent) {
        let mut watchers = self.watchers.lock().expect("watchers lock poisoned");
        if let Some(senders) = watchers.get_mut(group) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn release_claims_of(&self, group: &str, consumer: &str) {
        self.claims
            .retain(|(g, _, _), owner| !(g == group && owner == consumer));
    }
}

#[async_trait]
impl GroupCoordinator for InMemoryCoordinator {
    async fn register_consumer(
        &self,
        group: &str,
        consumer: &str,
        subscription: &Subscription,
    ) -> Result<(), CoordinationError> {
        self.groups
            .lock()
            .expect("groups lock poisoned")
            .entry(group.to_string())
            .or_default()
            .insert(consumer.to_string(), subscription.clone());
        self.notify_group(group, GroupEvent::MembershipChanged);
        Ok(())
    }

    async fn deregister_consumer(
        &self,
        group: &str,
        consumer: &str,
    ) -> Result<(), CoordinationError> {
        let removed = self
            .groups
            .lock()
            .expect("groups lock poisoned")
            .get_mut(group)
            .map(|members| members.remove(consumer).is_some())
            .unwrap_or(false);
        if removed {
            self.release_claims_of(group, consumer);
            self.notify_group(group, GroupEvent::MembershipChanged);
        }
        Ok(())
    }

    async fn consumers_in_group(&self, group: &str) -> Result<Vec<String>, CoordinationError> {
        Ok(self
            .groups
            .lock()
            .expect("groups lock poisoned")
            .get(group)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn watch_group(
        &self,
        group: &str,
    ) -> Result<mpsc::UnboundedReceiver<GroupEvent>, CoordinationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .expect("watchers lock poisoned")
            .entry(group.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn claim_partition(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        owner: &str,
    ) -> Result<ClaimOutcome, CoordinationError> {
        let key = (group.to_string(), topic.to_string(), partition);
        match self.claims.entry(key) {
            Entry::Occupied(holder) if holder.get() != owner => {
                Ok(ClaimOutcome::AlreadyOwned(holder.get().clone()))
            }
            Entry::Occupied(_) => Ok(ClaimOutcome::Claimed),
            Entry::Vacant(vacant) => {
                vacant.insert(owner.to_string());
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn release_partition(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        owner: &str,
    ) -> Result<(), CoordinationError> {
        let key = (group.to_string(), topic.to_string(), partition);
        self.claims.remove_if(&key, |_, holder| holder == owner);
        Ok(())
    }

    async fn fetch_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>, CoordinationError> {
        Ok(self
            .offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|entry| *entry.value()))
    }

    async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), CoordinationError> {
        if self
            .commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CoordinationError::Unavailable(
                "injected commit failure".to_string(),
            ));
        }
        self.offsets
            .insert((group.to_string(), topic.to_string(), partition), offset);
        Ok(())
    }

    async fn request_deployment_swap(
        &self,
        blue: DeploymentTarget,
        green: DeploymentTarget,
    ) -> Result<(), CoordinationError> {
        let request = BlueGreenRequest {
            id: Uuid::new_v4().to_string(),
            blue: blue.clone(),
            green: green.clone(),
        };

        // Every consumer currently in either group must consume the request
        // exactly once before it clears.
        let pending_acks: HashSet<String> = {
            let groups = self.groups.lock().expect("groups lock poisoned");
            [&blue.group, &green.group]
                .into_iter()
                .filter_map(|g| groups.get(g))
                .flat_map(|members| members.keys().cloned())
                .collect()
        };
        self.swaps
            .lock()
            .expect("swaps lock poisoned")
            .push(SwapState {
                request: request.clone(),
                pending_acks,
            });

        self.notify_group(&blue.group, GroupEvent::DeploymentRequested(request.clone()));
        self.notify_group(&green.group, GroupEvent::DeploymentRequested(request));
        Ok(())
    }

    async fn acknowledge_deployment_swap(
        &self,
        request_id: &str,
        consumer: &str,
    ) -> Result<(), CoordinationError> {
        let mut swaps = self.swaps.lock().expect("swaps lock poisoned");
        if let Some(swap) = swaps.iter_mut().find(|s| s.request.id == request_id) {
            swap.pending_acks.remove(consumer);
        }
        swaps.retain(|s| !s.pending_acks.is_empty());
        Ok(())
    }
}
