use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;

use crate::error::MetadataError;

/// Pattern-based topic selection for wildcard subscriptions. A whitelist
/// keeps matching topics, a blacklist keeps everything else.
#[derive(Debug, Clone)]
pub enum TopicFilter {
    WhiteList(Regex),
    BlackList(Regex),
}

impl TopicFilter {
    pub fn white_list(pattern: &str) -> Result<Self, regex::Error> {
        Ok(TopicFilter::WhiteList(Regex::new(pattern)?))
    }

    pub fn black_list(pattern: &str) -> Result<Self, regex::Error> {
        Ok(TopicFilter::BlackList(Regex::new(pattern)?))
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::WhiteList(re) => re.is_match(topic),
            TopicFilter::BlackList(re) => !re.is_match(topic),
        }
    }

    /// Filter a topic list, returning matches in sorted order so downstream
    /// assignment computations see a stable set.
    pub fn select(&self, topics: &[String]) -> Vec<String> {
        let mut selected: Vec<String> = topics
            .iter()
            .filter(|t| self.matches(t))
            .cloned()
            .collect();
        selected.sort();
        selected
    }
}

/// Topic/partition discovery collaborator.
///
/// The rebalance coordinator consults this on every trigger so wildcard
/// subscriptions pick up newly created topics, and subscribes to
/// `watch_topics` to be woken when the topic set changes.
#[async_trait]
pub trait MetadataService: Send + Sync + 'static {
    /// All topic names currently known to the cluster.
    async fn topics(&self) -> Result<Vec<String>, MetadataError>;

    /// Partition numbers for a topic, in ascending order.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, MetadataError>;

    /// Notification stream that yields whenever the topic set or any
    /// topic's partition count changes.
    async fn watch_topics(&self) -> Result<mpsc::UnboundedReceiver<()>, MetadataError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn white_list_matches_pattern() {
        let filter = TopicFilter::white_list("orders-.+").unwrap();
        assert!(filter.matches("orders-eu"));
        assert!(filter.matches("orders-us"));
        assert!(!filter.matches("payments"));
    }

    #[test]
    fn black_list_inverts() {
        let filter = TopicFilter::black_list("internal-.+").unwrap();
        assert!(!filter.matches("internal-audit"));
        assert!(filter.matches("orders"));
    }

    #[test]
    fn select_is_sorted_and_filtered() {
        let filter = TopicFilter::white_list("t-.+").unwrap();
        let topics = vec![
            "t-b".to_string(),
            "skip".to_string(),
            "t-a".to_string(),
            "t-c".to_string(),
        ];
        assert_eq!(filter.select(&topics), vec!["t-a", "t-b", "t-c"]);
    }
}
