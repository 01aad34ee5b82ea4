use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::{ClientConfig, Message, TopicPartitionList};
use tracing::debug;

use crate::config::{BrokerConfig, ConsumerCoreConfig};
use crate::error::BrokerError;
use crate::rebalance::RebalanceContext;
use crate::state::StateCell;
use crate::types::{Record, TopicPartition};

/// Scoped, exclusive access to the non-thread-safe broker handle. A
/// non-blocking `try_lock` on entry turns accidental re-entrant or
/// cross-thread use into an immediate error instead of a deadlock; the actor
/// itself never re-enters since it's single-threaded with respect to this
/// guard by construction.
struct HandleGuard<T> {
    inner: Mutex<T>,
}

impl<T> HandleGuard<T> {
    fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Runs `f` inside the critical section. Panics if the guard is already
    /// held, which would indicate a re-entrant call from the actor itself —
    /// a programming error, not a runtime condition to recover from.
    fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        let guard = self
            .inner
            .try_lock()
            .expect("broker handle accessed re-entrantly or concurrently");
        f(&guard)
    }
}

/// Abstracts the broker operations the actor depends on, so the
/// actor is testable without a live broker. All operations are synchronous
/// and assume exclusive access — callers must serialize through a single
/// actor, exactly as the concrete adapter does via [`HandleGuard`].
#[cfg_attr(test, mockall::automock)]
pub trait BrokerClient: Send + Sync {
    fn subscribe_topics(&self, topics: &[String]) -> Result<(), BrokerError>;
    fn subscribe_pattern(&self, pattern: &str) -> Result<(), BrokerError>;
    fn assignment(&self) -> Result<HashSet<TopicPartition>, BrokerError>;
    fn pause(&self, partitions: &HashSet<TopicPartition>) -> Result<(), BrokerError>;
    fn resume(&self, partitions: &HashSet<TopicPartition>) -> Result<(), BrokerError>;
    fn poll(&self, timeout: Duration) -> Result<HashMap<TopicPartition, Vec<Record>>, BrokerError>;
    fn commit_async(
        &self,
        offsets: &HashMap<TopicPartition, (i64, Option<String>)>,
    ) -> Result<(), BrokerError>;
}

/// Production `BrokerClient` backed by `rdkafka::consumer::BaseConsumer`: the
/// non-thread-safe, poll-driven consumer handle this whole crate mediates
/// access to. The rebalance listener lives in the consumer's
/// `RebalanceContext` and is invoked synchronously, inline, by `poll`.
pub struct RdKafkaBroker {
    handle: HandleGuard<BaseConsumer<RebalanceContext>>,
}

impl RdKafkaBroker {
    pub fn new(
        broker_config: &BrokerConfig,
        consumer_config: &ConsumerCoreConfig,
        state: Arc<StateCell>,
    ) -> Result<Self, BrokerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &broker_config.bootstrap_servers)
            .set(
                "statistics.interval.ms",
                broker_config.statistics_interval_ms.to_string(),
            )
            .set("auto.offset.reset", &consumer_config.offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        if let Some(group_id) = &consumer_config.group_id {
            client_config.set("group.id", group_id);
        }

        if broker_config.tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: BaseConsumer<RebalanceContext> =
            client_config.create_with_context(RebalanceContext::new(state))?;

        Ok(Self {
            handle: HandleGuard::new(consumer),
        })
    }
}

impl BrokerClient for RdKafkaBroker {
    fn subscribe_topics(&self, topics: &[String]) -> Result<(), BrokerError> {
        let owned: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.handle.with(|c| c.subscribe(&owned)).map_err(Into::into)
    }

    fn subscribe_pattern(&self, pattern: &str) -> Result<(), BrokerError> {
        // librdkafka treats a topic string starting with `^` as a regex
        // subscription; validate it's a real pattern first so a bad regex
        // surfaces as `SubscribeFailure` rather than a silent literal-topic
        // subscribe.
        regex::Regex::new(pattern)?;
        let subscription = format!("^{pattern}");
        self.handle
            .with(|c| c.subscribe(&[subscription.as_str()]))
            .map_err(Into::into)
    }

    fn assignment(&self) -> Result<HashSet<TopicPartition>, BrokerError> {
        let tpl = self.handle.with(|c| c.assignment())?;
        Ok(tpl
            .elements()
            .iter()
            .map(|e| TopicPartition::new(e.topic(), e.partition()))
            .collect())
    }

    fn pause(&self, partitions: &HashSet<TopicPartition>) -> Result<(), BrokerError> {
        if partitions.is_empty() {
            return Ok(());
        }
        let tpl = to_tpl(partitions);
        self.handle.with(|c| c.pause(&tpl)).map_err(Into::into)
    }

    fn resume(&self, partitions: &HashSet<TopicPartition>) -> Result<(), BrokerError> {
        if partitions.is_empty() {
            return Ok(());
        }
        let tpl = to_tpl(partitions);
        self.handle.with(|c| c.resume(&tpl)).map_err(Into::into)
    }

    fn poll(&self, timeout: Duration) -> Result<HashMap<TopicPartition, Vec<Record>>, BrokerError> {
        self.handle.with(|c| {
            let mut batch: HashMap<TopicPartition, Vec<Record>> = HashMap::new();

            match c.poll(timeout) {
                Some(Ok(msg)) => push_message(&mut batch, &msg),
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(batch),
            }

            // Drain whatever else is immediately available so one poll call
            // can return a real batch, not just a single message.
            loop {
                match c.poll(Duration::ZERO) {
                    Some(Ok(msg)) => push_message(&mut batch, &msg),
                    Some(Err(err)) => return Err(err.into()),
                    None => break,
                }
            }

            Ok(batch)
        })
    }

    fn commit_async(
        &self,
        offsets: &HashMap<TopicPartition, (i64, Option<String>)>,
    ) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, (offset, metadata)) in offsets {
            let element = tpl.add_partition(&partition.topic, partition.partition);
            element.set_offset(rdkafka::Offset::Offset(*offset))?;
            if let Some(metadata) = metadata {
                element.set_metadata(metadata);
            }
        }
        self.handle
            .with(|c| c.commit(&tpl, rdkafka::consumer::CommitMode::Async))
            .map_err(Into::into)
    }
}

fn to_tpl(partitions: &HashSet<TopicPartition>) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for p in partitions {
        tpl.add_partition(&p.topic, p.partition);
    }
    tpl
}

fn push_message(batch: &mut HashMap<TopicPartition, Vec<Record>>, msg: &rdkafka::message::BorrowedMessage<'_>) {
    let partition = TopicPartition::new(msg.topic(), msg.partition());
    let record = Record {
        partition: partition.clone(),
        offset: msg.offset(),
        key: msg.key().map(|b| b.to_vec()),
        payload: msg.payload().map(|b| b.to_vec()),
        timestamp_ms: msg.timestamp().to_millis(),
    };
    batch.entry(partition).or_default().push(record);
}
