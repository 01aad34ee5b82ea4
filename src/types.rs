use std::cmp::Ordering;
use std::fmt;

/// An addressable append-only log: (topic, partition).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl Ord for TopicPartition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.topic
            .cmp(&other.topic)
            .then_with(|| self.partition.cmp(&other.partition))
    }
}

impl PartialOrd for TopicPartition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Identifies one downstream consumer of a partition. Unique only per-partition,
/// not globally.
pub type StreamId = u64;

/// A single record handed back to the actor by a broker poll. Deserialization is
/// out of scope here; this crate only moves bytes and offsets around.
#[derive(Debug, Clone)]
pub struct Record {
    pub partition: TopicPartition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp_ms: Option<i64>,
}

/// Why a `FetchRequest` completed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FetchReason {
    FetchedRecords,
    TopicPartitionRevoked,
}

/// Default `record_metadata` hook: the conservative choice of empty
/// metadata. Callers that want the broker to carry, e.g., a processing
/// timestamp alongside the committed offset supply their own closure to
/// `actor::spawn` instead.
pub fn no_record_metadata(_record: &Record) -> String {
    String::new()
}
