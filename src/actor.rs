use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::commit_recovery::CommitRecovery;
use crate::config::ConsumerCoreConfig;
use crate::error::ConsumerCoreError;
use crate::request::{ActorHandle, Request};
use crate::state::{CommitRequest, FetchRequest, StateCell};

const METRIC_FETCHES_STORED: &str = "consumer_core_fetches_stored_total";
const METRIC_FETCHES_REVOKED: &str = "consumer_core_fetches_revoked_total";
const METRIC_COMMITS_PARKED: &str = "consumer_core_pending_commits";
const METRIC_COMMITS_FLUSHED: &str = "consumer_core_commits_flushed_total";
const METRIC_POLLS: &str = "consumer_core_polls_total";

/// The serialized request-dispatch actor. Owns the only reference to the
/// broker handle and the only writer to `StateCell`; every other piece of
/// this crate talks to it through an [`ActorHandle`].
pub struct Actor {
    state: Arc<StateCell>,
    broker: Arc<dyn BrokerClient>,
    config: ConsumerCoreConfig,
    receiver: mpsc::UnboundedReceiver<Request>,
}

/// Spawns the actor's dispatch loop as a `tokio` task and returns a handle to
/// it. The caller is still responsible for driving periodic polls — see
/// [`crate::poll_driver::spawn_poll_driver`].
///
/// `record_metadata` is the construction-time hook a downstream record
/// consumer uses to turn a delivered `Record` into the metadata string
/// attached to its eventual commit; this crate only carries it through to
/// [`ActorHandle::record_metadata`] since building the `Record -> metadata`
/// string is outside the actor's own responsibilities.
pub fn spawn(
    config: ConsumerCoreConfig,
    broker: Arc<dyn BrokerClient>,
    commit_recovery: Arc<dyn CommitRecovery>,
    record_metadata: Arc<dyn Fn(&crate::types::Record) -> String + Send + Sync>,
) -> (ActorHandle, tokio::task::JoinHandle<Result<(), ConsumerCoreError>>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let state = StateCell::new();
    let commit_timeout = config.commit_timeout();

    let actor = Actor {
        state,
        broker,
        config,
        receiver,
    };
    let handle = ActorHandle::new(sender, commit_timeout, commit_recovery, record_metadata);
    let join = tokio::spawn(actor.run());
    (handle, join)
}

impl Actor {
    async fn run(mut self) -> Result<(), ConsumerCoreError> {
        let result = self.dispatch_loop().await;
        self.teardown();
        result
    }

    async fn dispatch_loop(&mut self) -> Result<(), ConsumerCoreError> {
        while let Some(request) = self.receiver.recv().await {
            match request {
                Request::SubscribeTopics { topics, respond } => {
                    self.handle_subscribe_topics(topics, respond)
                }
                Request::SubscribePattern { pattern, respond } => {
                    self.handle_subscribe_pattern(pattern, respond)
                }
                Request::Assignment {
                    on_rebalance,
                    respond,
                } => self.handle_assignment(on_rebalance, respond),
                Request::Fetch {
                    partition,
                    stream_id,
                    respond,
                } => self.handle_fetch(partition, stream_id, respond),
                Request::Commit { offsets, respond } => self.handle_commit(offsets, respond),
                Request::Poll => self.handle_poll()?,
            }
        }
        Ok(())
    }

    /// Any `FetchRequest`s still waiting when the actor shuts down must be
    /// completed rather than silently dropped, so no downstream stream hangs
    /// forever.
    fn teardown(&self) {
        let removed = self.state.update(|state| {
            let all: HashSet<_> = state.fetches.keys().cloned().collect();
            state.without_fetches(&all)
        });
        for fetch in removed {
            fetch.complete_revoked();
        }
    }

    fn handle_subscribe_topics(
        &self,
        topics: Vec<String>,
        respond: oneshot::Sender<Result<(), ConsumerCoreError>>,
    ) {
        let broker = self.broker.clone();
        let result = tokio::task::block_in_place(move || broker.subscribe_topics(&topics));
        self.finish_subscribe(result, respond);
    }

    fn handle_subscribe_pattern(
        &self,
        pattern: String,
        respond: oneshot::Sender<Result<(), ConsumerCoreError>>,
    ) {
        let broker = self.broker.clone();
        let result = tokio::task::block_in_place(move || broker.subscribe_pattern(&pattern));
        self.finish_subscribe(result, respond);
    }

    fn finish_subscribe(
        &self,
        result: Result<(), crate::error::BrokerError>,
        respond: oneshot::Sender<Result<(), ConsumerCoreError>>,
    ) {
        match result {
            Ok(()) => {
                self.state.update(|state| (state.as_subscribed(), ()));
                info!("subscribed");
                let _ = respond.send(Ok(()));
            }
            Err(err) => {
                warn!(error = %err, "subscribe failed");
                let _ = respond.send(Err(ConsumerCoreError::SubscribeFailure(err)));
            }
        }
    }

    fn handle_assignment(
        &self,
        on_rebalance: Option<Arc<dyn crate::rebalance::RebalanceHandler>>,
        respond: oneshot::Sender<Result<HashSet<crate::types::TopicPartition>, ConsumerCoreError>>,
    ) {
        let subscribed = self.state.update(|state| {
            let subscribed = state.subscribed;
            let mut state = state.as_streaming();
            if let Some(handler) = on_rebalance {
                state = state.with_on_rebalance(handler);
                info!("stored-on-rebalance");
            }
            (state, subscribed)
        });

        if !subscribed {
            let _ = respond.send(Err(ConsumerCoreError::NotSubscribed));
            return;
        }

        let result = self.broker.assignment().map_err(ConsumerCoreError::from);
        let _ = respond.send(result);
    }

    fn handle_fetch(
        &self,
        partition: crate::types::TopicPartition,
        stream_id: crate::types::StreamId,
        respond: oneshot::Sender<(Arc<[crate::types::Record]>, crate::types::FetchReason)>,
    ) {
        let fetch_request = FetchRequest::new(respond);

        let assigned = match self.broker.assignment() {
            Ok(assigned) => assigned,
            Err(err) => {
                warn!(error = %err, "assignment check failed, treating fetch as unassigned");
                HashSet::new()
            }
        };

        if !assigned.contains(&partition) {
            fetch_request.complete_revoked();
            return;
        }

        let prior = self
            .state
            .update(|state| state.with_fetch(partition.clone(), stream_id, fetch_request));

        counter!(METRIC_FETCHES_STORED).increment(1);
        info!(%partition, stream_id, "stored-fetch");

        if let Some(prior) = prior {
            counter!(METRIC_FETCHES_REVOKED).increment(1);
            info!(%partition, stream_id, "revoked-previous-fetch");
            prior.complete_revoked();
        }
    }

    fn handle_commit(
        &self,
        offsets: std::collections::HashMap<crate::types::TopicPartition, (i64, Option<String>)>,
        respond: oneshot::Sender<Result<(), crate::error::BrokerError>>,
    ) {
        let rebalancing = self.state.with(|state| state.rebalancing);

        if rebalancing {
            let request = CommitRequest { offsets, completion: respond };
            self.state.update(|state| {
                (
                    state.with_pending_commit(request, self.config.max_pending_commits),
                    (),
                )
            });
            let parked_count = self.state.with(|s| s.pending_commits.len() as f64);
            gauge!(METRIC_COMMITS_PARKED).set(parked_count);
            info!("stored-pending-commit");
            return;
        }

        self.commit_async(offsets, respond);
    }

    /// Submits the commit to the broker and parks the completion until
    /// `commit_callback` fires (see `rebalance.rs`). If the submit call
    /// itself fails synchronously, completes immediately with that error.
    fn commit_async(
        &self,
        offsets: std::collections::HashMap<crate::types::TopicPartition, (i64, Option<String>)>,
        respond: oneshot::Sender<Result<(), crate::error::BrokerError>>,
    ) {
        match self.broker.commit_async(&offsets) {
            Ok(()) => {
                self.state
                    .update(|state| (state.with_in_flight_commit(respond), ()));
            }
            Err(err) => {
                let _ = respond.send(Err(err));
            }
        }
    }

    fn handle_poll(&self) -> Result<(), ConsumerCoreError> {
        let (subscribed, streaming, initial_rebalancing) = self
            .state
            .with(|s| (s.subscribed, s.streaming, s.rebalancing));

        if !(subscribed && streaming) {
            return Ok(());
        }

        counter!(METRIC_POLLS).increment(1);

        let requested: HashSet<_> = self.state.with(|s| s.fetches.keys().cloned().collect());
        let poll_timeout = self.config.poll_timeout();
        let broker = self.broker.clone();

        // `BrokerClient::poll` ultimately calls `BaseConsumer::poll`, which blocks the
        // calling thread for up to `poll_timeout`. Run the whole pause/resume/poll
        // sequence via `block_in_place` so it doesn't stall other tasks on this
        // worker thread; `broker` only borrows `requested`, so `spawn_blocking`
        // (which needs `'static`) isn't an option here.
        let batch = tokio::task::block_in_place(move || -> Result<_, ConsumerCoreError> {
            let assigned = broker.assignment()?;

            if requested.is_empty() {
                broker.pause(&assigned)?;
                let batch = broker.poll(Duration::ZERO)?;
                if !batch.is_empty() {
                    return Err(ConsumerCoreError::UnexpectedRecords(
                        batch.keys().cloned().collect(),
                    ));
                }
                Ok(batch)
            } else {
                let resume: HashSet<_> = requested.intersection(&assigned).cloned().collect();
                let pause: HashSet<_> = assigned.difference(&resume).cloned().collect();
                broker.pause(&pause)?;
                broker.resume(&resume)?;
                Ok(broker.poll(poll_timeout)?)
            }
        })?;

        self.distribute(batch)?;
        self.flush_parked_commits(initial_rebalancing);

        Ok(())
    }

    fn distribute(
        &self,
        batch: std::collections::HashMap<crate::types::TopicPartition, Vec<crate::types::Record>>,
    ) -> Result<(), ConsumerCoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let known: HashSet<_> = self.state.with(|s| s.fetches.keys().cloned().collect());
        let unexpected: Vec<_> = batch.keys().filter(|p| !known.contains(*p)).cloned().collect();
        if !unexpected.is_empty() {
            return Err(ConsumerCoreError::UnexpectedRecords(unexpected));
        }

        let keys: HashSet<_> = batch.keys().cloned().collect();
        let completions = self.state.update(|state| {
            let mut completions = Vec::new();
            let mut state = state;
            for (partition, records) in &batch {
                if let Some(by_stream) = state.fetches.remove(partition) {
                    let chunk: Arc<[crate::types::Record]> = Arc::from(records.clone());
                    for (_, fetch) in by_stream {
                        completions.push((fetch, chunk.clone()));
                    }
                }
            }
            (state, completions)
        });

        info!(partitions = keys.len(), "completed-fetches-with-records");
        for (fetch, chunk) in completions {
            fetch.complete_with_records(chunk);
        }

        Ok(())
    }

    fn flush_parked_commits(&self, initial_rebalancing: bool) {
        let now_settled = self.state.with(|s| !s.rebalancing);
        if !(initial_rebalancing && now_settled) {
            return;
        }

        let parked = self
            .state
            .update(|state| state.without_pending_commits());
        if parked.is_empty() {
            return;
        }

        counter!(METRIC_COMMITS_FLUSHED).increment(parked.len() as u64);
        gauge!(METRIC_COMMITS_PARKED).set(0.0);
        info!(count = parked.len(), "committed-pending-commits");

        for request in parked {
            self.commit_async(request.offsets, request.completion);
        }
    }
}
