//! Metric names emitted through the `metrics` facade.

pub const FETCHER_BATCHES_DELIVERED: &str = "group_consumer_fetcher_batches_delivered";
pub const FETCHER_FETCH_ERRORS: &str = "group_consumer_fetcher_fetch_errors";

pub const TASKS_DISPATCHED: &str = "group_consumer_tasks_dispatched";
pub const TASKS_COMPLETED: &str = "group_consumer_tasks_completed";
pub const IN_FLIGHT_TASKS: &str = "group_consumer_in_flight_tasks";
pub const IN_FLIGHT_BYTES: &str = "group_consumer_in_flight_bytes";

pub const OFFSET_COMMITS: &str = "group_consumer_offset_commits";
pub const OFFSET_COMMIT_ERRORS: &str = "group_consumer_offset_commit_errors";

pub const REBALANCES_TOTAL: &str = "group_consumer_rebalances_total";
pub const CLAIM_CONFLICTS: &str = "group_consumer_claim_conflicts";
pub const OWNED_PARTITIONS: &str = "group_consumer_owned_partitions";
