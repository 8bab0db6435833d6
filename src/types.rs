use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// Identifies exactly one message position in the log. Unique per
/// (topic, partition, offset).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId {
    partition: Partition,
    offset: i64,
}

impl TaskId {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// A unit of work handed to a Worker. Created when a message is dispatched,
/// retired when its result is finalized.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    attempts: u32,
}

impl Task {
    pub fn new(id: TaskId) -> Self {
        Self { id, attempts: 0 }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempts += 1;
    }
}

/// Terminal outcome of one strategy invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerResult {
    Success(TaskId),
    Failure(TaskId, String),
    /// Processed, but the offset must not be committed. The commit frontier
    /// never advances past a skipped offset, so a restart redelivers from it.
    SkipCommit(TaskId),
}

impl WorkerResult {
    pub fn task_id(&self) -> &TaskId {
        match self {
            WorkerResult::Success(id)
            | WorkerResult::Failure(id, _)
            | WorkerResult::SkipCommit(id) => id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkerResult::Success(_))
    }
}

/// Decision vocabulary shared by the two failure callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedDecision {
    CommitOffsetAndContinue,
    DoNotCommitOffsetAndContinue,
    CommitOffsetAndStop,
    DoNotCommitOffsetAndStop,
}

impl FailedDecision {
    /// Whether the failed task's offset may still be committed.
    pub fn commits_offset(&self) -> bool {
        matches!(
            self,
            FailedDecision::CommitOffsetAndContinue | FailedDecision::CommitOffsetAndStop
        )
    }

    /// Whether the owning worker manager must halt.
    pub fn stops(&self) -> bool {
        matches!(
            self,
            FailedDecision::CommitOffsetAndStop | FailedDecision::DoNotCommitOffsetAndStop
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_id(offset: i64) -> TaskId {
        TaskId::new(Partition::new("orders".to_string(), 3), offset)
    }

    #[test]
    fn task_id_accessors_and_display() {
        let id = task_id(42);
        assert_eq!(id.topic(), "orders");
        assert_eq!(id.partition_number(), 3);
        assert_eq!(id.offset(), 42);
        assert_eq!(id.to_string(), "orders:3@42");
    }

    #[test]
    fn worker_result_task_id() {
        let id = task_id(7);
        assert_eq!(WorkerResult::Success(id.clone()).task_id(), &id);
        assert_eq!(
            WorkerResult::Failure(id.clone(), "boom".to_string()).task_id(),
            &id
        );
        assert_eq!(WorkerResult::SkipCommit(id.clone()).task_id(), &id);
        assert!(WorkerResult::Success(id.clone()).is_success());
        assert!(!WorkerResult::SkipCommit(id).is_success());
    }

    #[test_case::test_case(FailedDecision::CommitOffsetAndContinue, true, false)]
    #[test_case::test_case(FailedDecision::DoNotCommitOffsetAndContinue, false, false)]
    #[test_case::test_case(FailedDecision::CommitOffsetAndStop, true, true)]
    #[test_case::test_case(FailedDecision::DoNotCommitOffsetAndStop, false, true)]
    fn failed_decision_matrix(decision: FailedDecision, commits: bool, stops: bool) {
        assert_eq!(decision.commits_offset(), commits);
        assert_eq!(decision.stops(), stops);
    }

    #[test]
    fn task_attempt_counter() {
        let mut task = Task::new(task_id(0));
        assert_eq!(task.attempts(), 0);
        task.record_attempt();
        task.record_attempt();
        assert_eq!(task.attempts(), 2);
    }
}
