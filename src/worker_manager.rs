//! Worker manager: owns all in-flight tasks for one assigned partition.
//!
//! Messages arrive in batches through a bounded input (the fetcher blocks
//! when it is full), are dispatched to at most `num_workers` concurrent
//! workers, and completions fold into a per-partition commit frontier that
//! only ever advances past offsets with a terminal result. The frontier is
//! private to the manager task; completions reach it over a channel, so no
//! shared mutable state is involved.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::backoff::retry_delay;
use crate::config::ConsumerConfig;
use crate::coordinator::GroupCoordinator;
use crate::error::{ConsumerError, CoordinationError, PipelineFailure};
use crate::message::Message;
use crate::metrics_consts::{
    IN_FLIGHT_BYTES, IN_FLIGHT_TASKS, OFFSET_COMMITS, OFFSET_COMMIT_ERRORS, TASKS_COMPLETED,
    TASKS_DISPATCHED,
};
use crate::types::{FailedDecision, Partition, Task, WorkerResult};
use crate::worker::{Worker, WorkerContext, WorkerStrategy};

/// Snapshot handed to `WorkerFailureCallback` when the manager itself can
/// no longer make progress.
#[derive(Debug, Clone)]
pub struct ManagerContext {
    pub partition: Partition,
    pub in_flight: usize,
    /// Last checkpoint written to the coordination store ("next offset to
    /// consume" semantics).
    pub last_committed: i64,
}

/// Coarse-grained failure policy hook: consulted when the manager cannot
/// make progress (e.g. offset commits keep failing).
pub type WorkerFailureCallback = Arc<dyn Fn(&ManagerContext) -> FailedDecision + Send + Sync>;

/// Per-task failure policy hook: consulted for every `WorkerResult::Failure`.
pub type WorkerFailedAttemptCallback =
    Arc<dyn Fn(&Task, &WorkerResult) -> FailedDecision + Send + Sync>;

/// Commit frontier for one partition.
///
/// `next_offset` is the checkpoint value: every offset below it has a
/// terminal result and may be committed. Out-of-order completions park in
/// `pending` until the sequence below them closes. A terminal result whose
/// policy forbids committing freezes the frontier permanently below that
/// offset; later offsets still process but are never reported as progress.
struct CommitFrontier {
    next_offset: i64,
    pending: BTreeMap<i64, bool>,
    halted: bool,
}

impl CommitFrontier {
    fn new(start_offset: i64) -> Self {
        Self {
            next_offset: start_offset,
            pending: BTreeMap::new(),
            halted: false,
        }
    }

    fn record(&mut self, offset: i64, commit: bool) {
        if offset < self.next_offset {
            // Stale completion from a redelivered overlap; already folded.
            return;
        }
        self.pending.insert(offset, commit);
        self.advance();
    }

    fn advance(&mut self) {
        while !self.halted {
            match self.pending.get(&self.next_offset) {
                Some(true) => {
                    self.pending.remove(&self.next_offset);
                    self.next_offset += 1;
                }
                Some(false) => {
                    self.pending.remove(&self.next_offset);
                    self.halted = true;
                }
                None => break,
            }
        }
    }

    /// Jump over a gap in the log (e.g. after an offset reset). Only legal
    /// when nothing is pending below the new position.
    fn realign(&mut self, offset: i64) {
        if !self.halted && self.pending.is_empty() && offset > self.next_offset {
            self.next_offset = offset;
        }
    }

    fn committable(&self) -> i64 {
        self.next_offset
    }
}

pub(crate) struct WorkerManager {
    partition: Partition,
    group_id: String,
    num_workers: usize,
    commit_interval: Duration,
    commit_max_retries: usize,
    commit_retry_backoff: Duration,
    drain_grace: Duration,
    strategy: WorkerStrategy,
    failed_attempt_callback: WorkerFailedAttemptCallback,
    failure_callback: WorkerFailureCallback,
    coordinator: Arc<dyn GroupCoordinator>,
    start_offset: i64,
    input: mpsc::Receiver<Vec<Message>>,
    shutdown: watch::Receiver<bool>,
    failure_tx: mpsc::UnboundedSender<PipelineFailure>,
}

const COMMIT_BACKOFF_CAP: Duration = Duration::from_secs(5);

impl WorkerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn from_config(
        config: &ConsumerConfig,
        partition: Partition,
        start_offset: i64,
        input: mpsc::Receiver<Vec<Message>>,
        shutdown: watch::Receiver<bool>,
        failure_tx: mpsc::UnboundedSender<PipelineFailure>,
    ) -> Self {
        Self {
            partition,
            group_id: config.group_id.clone(),
            num_workers: config.num_workers,
            commit_interval: config.commit_interval,
            commit_max_retries: config.commit_max_retries,
            commit_retry_backoff: config.commit_retry_backoff,
            drain_grace: config.drain_grace_period,
            strategy: config.strategy.clone(),
            failed_attempt_callback: config.worker_failed_attempt_callback.clone(),
            failure_callback: config.worker_failure_callback.clone(),
            coordinator: config.coordinator.clone(),
            start_offset,
            input,
            shutdown,
            failure_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let WorkerManager {
            partition,
            group_id,
            num_workers,
            commit_interval,
            commit_max_retries,
            commit_retry_backoff,
            drain_grace,
            strategy,
            failed_attempt_callback,
            failure_callback,
            coordinator,
            start_offset,
            mut input,
            mut shutdown,
            failure_tx,
        } = self;

        info!(partition = %partition, start_offset, num_workers, "worker manager started");

        let semaphore = Arc::new(Semaphore::new(num_workers));
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<(i64, WorkerResult)>();
        let mut frontier = CommitFrontier::new(start_offset);
        let mut last_committed = start_offset;
        let mut tasks: HashMap<i64, Task> = HashMap::new();
        let mut task_sizes: HashMap<i64, usize> = HashMap::new();
        let mut in_flight_bytes = 0usize;
        let mut worker_seq = 0usize;
        let mut stop_error: Option<ConsumerError> = None;

        let mut commit_tick = tokio::time::interval(commit_interval);
        commit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        'run: loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender means the pipeline owner is gone;
                    // treat it the same as an explicit stop.
                    if changed.is_err() || *shutdown.borrow() {
                        break 'run;
                    }
                }

                maybe_batch = input.recv() => {
                    let Some(batch) = maybe_batch else {
                        // Fetcher dropped the feed; pipeline is closing.
                        break 'run;
                    };
                    for message in batch {
                        let offset = message.offset;
                        if offset < frontier.committable() {
                            debug!(partition = %partition, offset, "skipping already-committed offset");
                            continue;
                        }
                        if tasks.is_empty() {
                            frontier.realign(offset);
                        }

                        let permit = loop {
                            tokio::select! {
                                permit = semaphore.clone().acquire_owned() => {
                                    break permit.expect("worker semaphore closed");
                                }
                                changed = shutdown.changed() => {
                                    if changed.is_err() || *shutdown.borrow() {
                                        break 'run;
                                    }
                                }
                            }
                        };

                        let mut task = Task::new(message.task_id());
                        task.record_attempt();
                        tasks.insert(offset, task);
                        task_sizes.insert(offset, message.payload_size());
                        in_flight_bytes += message.payload_size();
                        metrics::counter!(TASKS_DISPATCHED).increment(1);
                        metrics::gauge!(IN_FLIGHT_TASKS).set(tasks.len() as f64);
                        metrics::gauge!(IN_FLIGHT_BYTES).set(in_flight_bytes as f64);

                        let context = WorkerContext {
                            worker_id: worker_seq % num_workers,
                            partition: partition.clone(),
                        };
                        worker_seq += 1;

                        let tx = completion_tx.clone();
                        let strategy = strategy.clone();
                        tokio::spawn(async move {
                            let result = Worker::execute(context, message, strategy).await;
                            drop(permit);
                            drop(tx.send((offset, result)));
                        });
                    }
                }

                Some((offset, result)) = completion_rx.recv() => {
                    let halted = apply_completion(
                        &partition,
                        &mut tasks,
                        &mut frontier,
                        offset,
                        result,
                        &failed_attempt_callback,
                    );
                    in_flight_bytes -= task_sizes.remove(&offset).unwrap_or(0);
                    metrics::gauge!(IN_FLIGHT_TASKS).set(tasks.len() as f64);
                    metrics::gauge!(IN_FLIGHT_BYTES).set(in_flight_bytes as f64);
                    if let Some(task_id) = halted {
                        stop_error = Some(ConsumerError::PolicyStop { task: task_id });
                        break 'run;
                    }
                }

                _ = commit_tick.tick() => {
                    let target = frontier.committable();
                    if let Err(e) = commit_checkpoint(
                        coordinator.as_ref(),
                        &group_id,
                        &partition,
                        target,
                        &mut last_committed,
                        commit_max_retries,
                        commit_retry_backoff,
                    ).await {
                        let context = ManagerContext {
                            partition: partition.clone(),
                            in_flight: tasks.len(),
                            last_committed,
                        };
                        let decision = (failure_callback)(&context);
                        warn!(
                            partition = %partition,
                            decision = ?decision,
                            error = %e,
                            "offset commit failed permanently"
                        );
                        if decision.stops() {
                            stop_error = Some(ConsumerError::Commit {
                                partition: partition.clone(),
                                source: e,
                            });
                            break 'run;
                        }
                    }
                }
            }
        }

        // Drain: let already-dispatched tasks reach a terminal result within
        // the grace period, then tear down regardless.
        input.close();
        drop(completion_tx);
        let deadline = Instant::now() + drain_grace;
        while !tasks.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    partition = %partition,
                    in_flight = tasks.len(),
                    "drain grace period elapsed, forcing stop"
                );
                break;
            }
            match timeout(remaining, completion_rx.recv()).await {
                Ok(Some((offset, result))) => {
                    apply_completion(
                        &partition,
                        &mut tasks,
                        &mut frontier,
                        offset,
                        result,
                        &failed_attempt_callback,
                    );
                    in_flight_bytes -= task_sizes.remove(&offset).unwrap_or(0);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        partition = %partition,
                        in_flight = tasks.len(),
                        "drain grace period elapsed, forcing stop"
                    );
                    break;
                }
            }
        }

        // Final checkpoint before releasing the partition.
        let target = frontier.committable();
        if let Err(e) = commit_checkpoint(
            coordinator.as_ref(),
            &group_id,
            &partition,
            target,
            &mut last_committed,
            commit_max_retries,
            commit_retry_backoff,
        )
        .await
        {
            warn!(partition = %partition, error = %e, "final offset commit failed");
        }

        if let Some(error) = stop_error {
            drop(failure_tx.send(PipelineFailure {
                partition: partition.clone(),
                error,
            }));
        }

        info!(partition = %partition, last_committed, "worker manager stopped");
    }
}

/// Fold one completion into the frontier, applying the per-task failure
/// policy. Returns the task id when policy demands the manager stop.
fn apply_completion(
    partition: &Partition,
    tasks: &mut HashMap<i64, Task>,
    frontier: &mut CommitFrontier,
    offset: i64,
    result: WorkerResult,
    failed_attempt_callback: &WorkerFailedAttemptCallback,
) -> Option<crate::types::TaskId> {
    let Some(task) = tasks.remove(&offset) else {
        debug!(partition = %partition, offset, "completion for unknown task");
        return None;
    };

    match &result {
        WorkerResult::Success(_) => {
            metrics::counter!(TASKS_COMPLETED, "status" => "success").increment(1);
            frontier.record(offset, true);
            None
        }
        WorkerResult::SkipCommit(_) => {
            metrics::counter!(TASKS_COMPLETED, "status" => "skip_commit").increment(1);
            frontier.record(offset, false);
            None
        }
        WorkerResult::Failure(_, reason) => {
            metrics::counter!(TASKS_COMPLETED, "status" => "failure").increment(1);
            let decision = (failed_attempt_callback)(&task, &result);
            debug!(
                partition = %partition,
                offset,
                reason = %reason,
                decision = ?decision,
                "task failed"
            );
            frontier.record(offset, decision.commits_offset());
            if decision.stops() {
                Some(task.id().clone())
            } else {
                None
            }
        }
    }
}

async fn commit_checkpoint(
    coordinator: &dyn GroupCoordinator,
    group: &str,
    partition: &Partition,
    target: i64,
    last_committed: &mut i64,
    max_retries: usize,
    backoff: Duration,
) -> Result<(), CoordinationError> {
    if target <= *last_committed {
        return Ok(());
    }

    let mut attempt = 0;
    loop {
        match coordinator
            .commit_offset(group, partition.topic(), partition.partition_number(), target)
            .await
        {
            Ok(()) => {
                debug!(partition = %partition, offset = target, "committed checkpoint");
                metrics::counter!(OFFSET_COMMITS).increment(1);
                *last_committed = target;
                return Ok(());
            }
            Err(e) if attempt < max_retries => {
                attempt += 1;
                metrics::counter!(OFFSET_COMMIT_ERRORS).increment(1);
                let delay = retry_delay(backoff, attempt - 1, COMMIT_BACKOFF_CAP);
                warn!(
                    partition = %partition,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "commit failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                metrics::counter!(OFFSET_COMMIT_ERRORS).increment(1);
                return Err(e);
            }
        }
    }
}
