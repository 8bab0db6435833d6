//! Top-level consumer façade: owns the configuration, starts the rebalance
//! coordinator, and exposes the subscription entry points plus graceful
//! shutdown through a detached handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::metadata::TopicFilter;
use crate::rebalance::{RebalanceCoordinator, RebalanceState, SubscriptionSpec};

pub struct Consumer {
    config: ConsumerConfig,
    state_tx: watch::Sender<RebalanceState>,
    state_rx: watch::Receiver<RebalanceState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    abort: Arc<Mutex<Option<AbortHandle>>>,
}

impl Consumer {
    pub fn new(config: ConsumerConfig) -> Result<Self, ConsumerError> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(RebalanceState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            abort: Arc::new(Mutex::new(None)),
        })
    }

    /// Handle for observing state and requesting shutdown from outside the
    /// task that runs the consumer.
    pub fn handle(&self) -> ConsumerHandle {
        ConsumerHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            state_rx: self.state_rx.clone(),
            abort: self.abort.clone(),
        }
    }

    /// Subscribe to a fixed topic set with a per-topic stream count and run
    /// until closed. Runs the whole pipeline; callers normally spawn this.
    pub async fn start_static(
        self,
        topic_streams: HashMap<String, usize>,
    ) -> Result<(), ConsumerError> {
        if topic_streams.is_empty() {
            return Err(ConsumerError::InvalidConfig(
                "static subscription requires at least one topic".to_string(),
            ));
        }
        self.start(SubscriptionSpec::Static(topic_streams)).await
    }

    /// Subscribe to every topic matching the filter, re-evaluated on every
    /// rebalance trigger, and run until closed.
    pub async fn start_wildcard(
        self,
        filter: TopicFilter,
        streams: usize,
    ) -> Result<(), ConsumerError> {
        self.start(SubscriptionSpec::Wildcard {
            filter,
            streams: streams.max(1),
        })
        .await
    }

    async fn start(self, subscription: SubscriptionSpec) -> Result<(), ConsumerError> {
        info!(
            group = %self.config.group_id,
            consumer = %self.config.consumer_id,
            subscription = ?subscription,
            "starting consumer"
        );

        let coordinator = RebalanceCoordinator::new(
            self.config,
            subscription,
            self.state_tx,
            self.shutdown_rx,
        );
        let join = tokio::spawn(coordinator.run());
        *self.abort.lock().expect("abort slot poisoned") = Some(join.abort_handle());

        match join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

/// Cheap cloneable handle onto a running consumer.
#[derive(Clone)]
pub struct ConsumerHandle {
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<RebalanceState>,
    abort: Arc<Mutex<Option<AbortHandle>>>,
}

impl ConsumerHandle {
    pub fn state(&self) -> RebalanceState {
        *self.state_rx.borrow()
    }

    /// Wait until the consumer reaches `state`, bounded by `deadline`.
    /// Returns false on timeout or if the consumer task went away first.
    pub async fn wait_for_state(&mut self, state: RebalanceState, deadline: Duration) -> bool {
        matches!(
            tokio::time::timeout(deadline, self.state_rx.wait_for(|s| *s == state)).await,
            Ok(Ok(_))
        )
    }

    /// Request graceful shutdown: the rebalance coordinator drains and
    /// releases every owned partition, bounded by `timeout`. Past the
    /// bound the consumer task is aborted and `CloseTimeout` is returned.
    pub async fn close(mut self, timeout: Duration) -> Result<(), ConsumerError> {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(
            timeout,
            self.state_rx.wait_for(|s| *s == RebalanceState::Stopped),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            // State sender dropped: the consumer task already finished.
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                warn!("graceful close timed out, forcing shutdown");
                if let Some(handle) = self.abort.lock().expect("abort slot poisoned").take() {
                    handle.abort();
                }
                Err(ConsumerError::CloseTimeout(timeout))
            }
        }
    }
}
