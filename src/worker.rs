use std::sync::Arc;

use tracing::error;

use crate::message::Message;
use crate::types::{Partition, TaskId, WorkerResult};

/// Handed to the strategy on every invocation so user code can tell which
/// worker slot and partition it is running for.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub worker_id: usize,
    pub partition: Partition,
}

/// User-supplied processing function. Must be safe to invoke concurrently
/// from independent workers; each invocation owns a disjoint task.
pub type WorkerStrategy =
    Arc<dyn Fn(&WorkerContext, &Message, &TaskId) -> WorkerResult + Send + Sync>;

/// A single concurrent executor. Stateless: it applies the strategy to one
/// message and reports the outcome upward, nothing else.
pub struct Worker;

impl Worker {
    /// Run the strategy for one message on the blocking pool, so a slow or
    /// blocking strategy never stalls the async executor. A strategy panic
    /// is converted into `WorkerResult::Failure`, preserving the guarantee
    /// that every dispatched task yields exactly one terminal result.
    pub async fn execute(
        context: WorkerContext,
        message: Message,
        strategy: WorkerStrategy,
    ) -> WorkerResult {
        let task_id = message.task_id();
        let fallback_id = task_id.clone();

        let join = tokio::task::spawn_blocking(move || strategy(&context, &message, &task_id));

        match join.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!(task = %fallback_id, "strategy panicked");
                WorkerResult::Failure(fallback_id, "strategy panicked".to_string())
            }
            Err(_) => WorkerResult::Failure(fallback_id, "strategy cancelled".to_string()),
        }
    }
}
