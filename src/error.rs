use thiserror::Error;

use crate::types::TopicPartition;

/// Errors surfaced from the `BrokerClient` seam. Kept distinct from
/// `ConsumerCoreError` so an adapter's transport error can be forwarded
/// verbatim with `#[from]` without every internal error growing a broker
/// client dependency.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("pending commit queue is full")]
    PendingCommitsFull,
}

/// Errors returned to callers of the actor.
#[derive(Debug, Error)]
pub enum ConsumerCoreError {
    /// Assignment was requested before any successful subscribe call.
    #[error("assignment requested before subscribing")]
    NotSubscribed,

    /// `message_commit` exceeded its configured `commit_timeout`.
    #[error("commit timed out waiting for broker acknowledgement")]
    CommitTimeout,

    /// The broker reported an error on a commit callback.
    #[error("commit failed: {0}")]
    CommitFailure(#[source] BrokerError),

    /// The broker's subscribe call failed.
    #[error("subscribe failed: {0}")]
    SubscribeFailure(#[source] BrokerError),

    /// Invariant violation: the broker returned records that weren't
    /// requested, or returned records from a poll that should have been a
    /// no-op. Fatal to the actor.
    #[error("broker returned unexpected records for partitions {0:?}")]
    UnexpectedRecords(Vec<TopicPartition>),

    /// Transport-level error forwarded from the broker client adapter.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The actor's request queue has been closed (the actor has shut down).
    #[error("consumer actor is no longer running")]
    ActorGone,
}
