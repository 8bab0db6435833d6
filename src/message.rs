use chrono::{DateTime, Utc};

use crate::types::{Partition, TaskId};

/// An immutable record fetched from the log. Produced by the fetch client,
/// never mutated by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        topic: String,
        partition: i32,
        offset: i64,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            topic,
            partition,
            offset,
            key,
            value,
            timestamp,
        }
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }

    pub fn task_id(&self) -> TaskId {
        TaskId::new(self.partition(), self.offset)
    }

    /// Estimated heap footprint, used for in-flight accounting.
    pub fn payload_size(&self) -> usize {
        self.value.len() + self.key.as_ref().map(|k| k.len()).unwrap_or(0) + self.topic.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_matches_position() {
        let msg = Message::new(
            "events".to_string(),
            2,
            19,
            Some(b"key".to_vec()),
            b"value".to_vec(),
            Utc::now(),
        );
        let id = msg.task_id();
        assert_eq!(id.topic(), "events");
        assert_eq!(id.partition_number(), 2);
        assert_eq!(id.offset(), 19);
    }

    #[test]
    fn payload_size_counts_key_value_and_topic() {
        let msg = Message::new(
            "t".to_string(),
            0,
            0,
            Some(vec![0u8; 4]),
            vec![0u8; 10],
            Utc::now(),
        );
        assert_eq!(msg.payload_size(), 15);
    }
}
