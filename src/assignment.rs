use std::collections::{BTreeMap, HashMap};

use crate::types::Partition;

/// Trait for partition assignment strategies.
///
/// The rebalance coordinator calls `compute_assignments` on every trigger.
/// Implementations MUST be deterministic in the membership and partition
/// sets alone: racing consumers compute the assignment independently, and
/// only identical results keep the claim protocol from thrashing.
pub trait AssignmentStrategy: Send + Sync {
    /// Compute the desired partition-to-member mapping.
    ///
    /// - `members`: live consumer ids (any order; implementations sort)
    /// - `partitions`: full target partition set across all subscribed topics
    fn compute_assignments(
        &self,
        members: &[String],
        partitions: &[Partition],
    ) -> HashMap<Partition, String>;
}

/// Range distribution balanced per topic.
///
/// For each topic, the sorted partition list is split into contiguous
/// ranges over the sorted member list; every member receives either
/// `floor(P/C)` or `ceil(P/C)` partitions of that topic, with the first
/// `P mod C` members taking the extra one. The result depends only on the
/// two input sets, never on call order or prior state.
pub struct BalancedRangeStrategy;

impl AssignmentStrategy for BalancedRangeStrategy {
    fn compute_assignments(
        &self,
        members: &[String],
        partitions: &[Partition],
    ) -> HashMap<Partition, String> {
        if members.is_empty() {
            return HashMap::new();
        }

        let mut sorted_members: Vec<&String> = members.iter().collect();
        sorted_members.sort();
        sorted_members.dedup();

        let mut by_topic: BTreeMap<&str, Vec<&Partition>> = BTreeMap::new();
        for partition in partitions {
            by_topic.entry(partition.topic()).or_default().push(partition);
        }

        let mut assignments = HashMap::with_capacity(partitions.len());
        for (_, mut topic_partitions) in by_topic {
            topic_partitions.sort_by_key(|p| p.partition_number());
            topic_partitions.dedup();

            let count = topic_partitions.len();
            let num_members = sorted_members.len();
            let per_member = count / num_members;
            let extra = count % num_members;

            let mut cursor = 0usize;
            for (i, member) in sorted_members.iter().enumerate() {
                let take = per_member + usize::from(i < extra);
                for partition in &topic_partitions[cursor..cursor + take] {
                    assignments.insert((*partition).clone(), (*member).clone());
                }
                cursor += take;
            }
        }

        assignments
    }
}

/// The subset of an assignment owned by one member, sorted for stable
/// pipeline startup order.
pub fn partitions_for<'a>(
    assignments: &'a HashMap<Partition, String>,
    member: &str,
) -> Vec<&'a Partition> {
    let mut owned: Vec<&Partition> = assignments
        .iter()
        .filter(|(_, owner)| owner.as_str() == member)
        .map(|(p, _)| p)
        .collect();
    owned.sort();
    owned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitions(topic: &str, count: i32) -> Vec<Partition> {
        (0..count)
            .map(|n| Partition::new(topic.to_string(), n))
            .collect()
    }

    fn members(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn empty_members_yields_empty() {
        let strategy = BalancedRangeStrategy;
        let result = strategy.compute_assignments(&[], &partitions("t", 8));
        assert!(result.is_empty());
    }

    #[test]
    fn even_split() {
        let strategy = BalancedRangeStrategy;
        let result =
            strategy.compute_assignments(&members(&["c-0", "c-1", "c-2"]), &partitions("t", 12));
        assert_eq!(result.len(), 12);
        for m in ["c-0", "c-1", "c-2"] {
            assert_eq!(result.values().filter(|v| *v == m).count(), 4);
        }
    }

    #[test]
    fn uneven_split_gives_floor_or_ceil() {
        let strategy = BalancedRangeStrategy;
        let result =
            strategy.compute_assignments(&members(&["c-0", "c-1", "c-2"]), &partitions("t", 10));
        let mut counts: Vec<usize> = ["c-0", "c-1", "c-2"]
            .iter()
            .map(|m| result.values().filter(|v| v.as_str() == *m).count())
            .collect();
        counts.sort();
        assert_eq!(counts, vec![3, 3, 4]);
    }

    #[test]
    fn deterministic_regardless_of_input_order() {
        let strategy = BalancedRangeStrategy;
        let parts = partitions("t", 7);
        let forward = strategy.compute_assignments(&members(&["b", "a", "c"]), &parts);

        let mut shuffled = parts.clone();
        shuffled.reverse();
        let backward = strategy.compute_assignments(&members(&["c", "b", "a"]), &shuffled);

        assert_eq!(forward, backward);
    }

    #[test]
    fn balances_each_topic_independently() {
        let strategy = BalancedRangeStrategy;
        let mut parts = partitions("t-a", 4);
        parts.extend(partitions("t-b", 4));
        let result = strategy.compute_assignments(&members(&["c-0", "c-1"]), &parts);

        for topic in ["t-a", "t-b"] {
            for m in ["c-0", "c-1"] {
                let count = result
                    .iter()
                    .filter(|(p, owner)| p.topic() == topic && owner.as_str() == m)
                    .count();
                assert_eq!(count, 2, "{m} should own 2 partitions of {topic}");
            }
        }
    }

    #[test]
    fn more_members_than_partitions_leaves_some_idle() {
        let strategy = BalancedRangeStrategy;
        let result = strategy.compute_assignments(
            &members(&["c-0", "c-1", "c-2", "c-3"]),
            &partitions("t", 2),
        );
        assert_eq!(result.len(), 2);
        // Sorted members c-0 and c-1 take the two partitions.
        assert!(result.values().all(|m| m == "c-0" || m == "c-1"));
    }

    #[test]
    fn partitions_for_returns_sorted_subset() {
        let strategy = BalancedRangeStrategy;
        let parts = partitions("t", 6);
        let result = strategy.compute_assignments(&members(&["c-0", "c-1"]), &parts);
        let owned = partitions_for(&result, "c-0");
        assert_eq!(owned.len(), 3);
        let numbers: Vec<i32> = owned.iter().map(|p| p.partition_number()).collect();
        let mut sorted = numbers.clone();
        sorted.sort();
        assert_eq!(numbers, sorted);
    }
}
