use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::commit_recovery::{CommitRecovery, RecoveryDecision};
use crate::error::{BrokerError, ConsumerCoreError};
use crate::rebalance::RebalanceHandler;
use crate::types::{FetchReason, Record, StreamId, TopicPartition};

/// The sum of operations the actor accepts. Dispatch is total: every variant
/// has a handler, and one request is fully handled — including its broker
/// interactions and completions — before the next is dequeued.
pub enum Request {
    Assignment {
        on_rebalance: Option<Arc<dyn RebalanceHandler>>,
        respond: oneshot::Sender<Result<HashSet<TopicPartition>, ConsumerCoreError>>,
    },
    Poll,
    SubscribeTopics {
        topics: Vec<String>,
        respond: oneshot::Sender<Result<(), ConsumerCoreError>>,
    },
    SubscribePattern {
        pattern: String,
        respond: oneshot::Sender<Result<(), ConsumerCoreError>>,
    },
    Fetch {
        partition: TopicPartition,
        stream_id: StreamId,
        respond: oneshot::Sender<(Arc<[Record]>, FetchReason)>,
    },
    Commit {
        offsets: HashMap<TopicPartition, (i64, Option<String>)>,
        respond: oneshot::Sender<Result<(), BrokerError>>,
    },
}

/// Cheaply-cloneable handle to the actor's request queue. This is the public
/// API surface downstream consumers use; the actor itself is never touched
/// directly.
#[derive(Clone)]
pub struct ActorHandle {
    sender: mpsc::UnboundedSender<Request>,
    commit_timeout: Duration,
    commit_recovery: Arc<dyn CommitRecovery>,
    record_metadata: Arc<dyn Fn(&Record) -> String + Send + Sync>,
}

impl ActorHandle {
    pub(crate) fn new(
        sender: mpsc::UnboundedSender<Request>,
        commit_timeout: Duration,
        commit_recovery: Arc<dyn CommitRecovery>,
        record_metadata: Arc<dyn Fn(&Record) -> String + Send + Sync>,
    ) -> Self {
        Self {
            sender,
            commit_timeout,
            commit_recovery,
            record_metadata,
        }
    }

    /// Applies the construction-time `record_metadata` hook to a delivered
    /// record. Downstream record consumers use this to build the
    /// metadata string they attach to the offset they eventually commit;
    /// deserialization and commit-offset bookkeeping themselves are out of
    /// scope for this crate.
    pub fn record_metadata(&self, record: &Record) -> String {
        (self.record_metadata)(record)
    }

    fn send(&self, request: Request) -> Result<(), ConsumerCoreError> {
        self.sender
            .send(request)
            .map_err(|_| ConsumerCoreError::ActorGone)
    }

    /// Enqueues a `Poll`. Used by the poll driver; exposed publicly so
    /// callers with unusual cadence requirements (tests, one-shot drains) can
    /// drive polling themselves.
    pub fn poll(&self) -> Result<(), ConsumerCoreError> {
        self.send(Request::Poll)
    }

    pub async fn subscribe_topics(&self, topics: Vec<String>) -> Result<(), ConsumerCoreError> {
        let (respond, rx) = oneshot::channel();
        self.send(Request::SubscribeTopics { topics, respond })?;
        rx.await.map_err(|_| ConsumerCoreError::ActorGone)?
    }

    pub async fn subscribe_pattern(&self, pattern: String) -> Result<(), ConsumerCoreError> {
        let (respond, rx) = oneshot::channel();
        self.send(Request::SubscribePattern { pattern, respond })?;
        rx.await.map_err(|_| ConsumerCoreError::ActorGone)?
    }

    pub async fn assignment(
        &self,
        on_rebalance: Option<Arc<dyn RebalanceHandler>>,
    ) -> Result<HashSet<TopicPartition>, ConsumerCoreError> {
        let (respond, rx) = oneshot::channel();
        self.send(Request::Assignment {
            on_rebalance,
            respond,
        })?;
        rx.await.map_err(|_| ConsumerCoreError::ActorGone)?
    }

    pub async fn fetch(
        &self,
        partition: TopicPartition,
        stream_id: StreamId,
    ) -> Result<(Arc<[Record]>, FetchReason), ConsumerCoreError> {
        let (respond, rx) = oneshot::channel();
        self.send(Request::Fetch {
            partition,
            stream_id,
            respond,
        })?;
        rx.await.map_err(|_| ConsumerCoreError::ActorGone)
    }

    /// Internal commit: enqueues a Commit request and waits for the broker's
    /// ack with no timeout of its own. See [`Self::message_commit`] for the
    /// externally-facing, timeout-and-recovery-wrapped variant.
    pub async fn commit(
        &self,
        offsets: HashMap<TopicPartition, (i64, Option<String>)>,
    ) -> Result<(), ConsumerCoreError> {
        let (respond, rx) = oneshot::channel();
        self.send(Request::Commit { offsets, respond })?;
        rx.await
            .map_err(|_| ConsumerCoreError::ActorGone)?
            .map_err(ConsumerCoreError::CommitFailure)
    }

    /// External convenience API for downstream record consumers: enqueue a
    /// Commit, race it against `commit_timeout`, and on timeout or
    /// failure delegate to the commit-recovery hook. The underlying broker
    /// commit may still land after a timeout is surfaced here — recovery
    /// decides what to retry, not whether the in-flight commit is cancelled.
    pub async fn message_commit(
        &self,
        offsets: HashMap<TopicPartition, (i64, Option<String>)>,
    ) -> Result<(), ConsumerCoreError> {
        let mut attempt = 0u32;
        loop {
            let outcome = tokio::time::timeout(self.commit_timeout, self.commit(offsets.clone())).await;

            let error = match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => err,
                Err(_) => ConsumerCoreError::CommitTimeout,
            };

            warn!(attempt, error = %error, "message_commit failed, consulting recovery hook");
            match self.commit_recovery.recover(&offsets, attempt) {
                RecoveryDecision::Retry => {
                    attempt += 1;
                    continue;
                }
                RecoveryDecision::Drop => return Err(error),
            }
        }
    }
}
