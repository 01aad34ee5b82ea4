use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::BrokerError;
use crate::rebalance::RebalanceHandler;
use crate::types::{FetchReason, Record, StreamId, TopicPartition};

/// A single-use completion token for a `(partition, stream)` fetch. Completing
/// consumes `self`, so the type system rules out double-completion.
pub struct FetchRequest {
    completion: oneshot::Sender<(Arc<[Record]>, FetchReason)>,
}

impl FetchRequest {
    pub fn new(completion: oneshot::Sender<(Arc<[Record]>, FetchReason)>) -> Self {
        Self { completion }
    }

    /// Complete with an empty chunk and `TopicPartitionRevoked`. Used whenever
    /// a fetch is displaced or its partition is revoked before it's served.
    pub fn complete_revoked(self) {
        let _ = self.completion.send((Arc::from(Vec::new()), FetchReason::TopicPartitionRevoked));
    }

    /// Complete with a delivered chunk of records.
    pub fn complete_with_records(self, records: Arc<[Record]>) {
        let _ = self.completion.send((records, FetchReason::FetchedRecords));
    }
}

/// A parked or in-flight commit request.
pub struct CommitRequest {
    pub offsets: HashMap<TopicPartition, (i64, Option<String>)>,
    pub completion: oneshot::Sender<Result<(), BrokerError>>,
}

/// Immutable snapshot of actor state. Every transition is a pure function
/// `State -> State` (or `State -> (State, extra)`); the actor swaps the whole
/// thing under [`StateCell`] rather than mutating fields in place.
#[derive(Default)]
pub struct State {
    pub fetches: HashMap<TopicPartition, HashMap<StreamId, FetchRequest>>,
    pub pending_commits: VecDeque<CommitRequest>,
    /// Completions for commits already submitted to the broker, awaiting
    /// `ConsumerContext::commit_callback`. FIFO: `BaseConsumer` acknowledges
    /// commits for one consumer in submission order, so the callback always
    /// resolves the oldest outstanding entry.
    pub in_flight_commits: VecDeque<oneshot::Sender<Result<(), BrokerError>>>,
    pub on_rebalances: Vec<Arc<dyn RebalanceHandler>>,
    pub rebalancing: bool,
    pub subscribed: bool,
    pub streaming: bool,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `fetches[p][s] = FetchRequest(d)`, returning the prior occupant of
    /// that slot, if any. Callers must complete the prior one with
    /// `TopicPartitionRevoked` so no waiter is stranded.
    pub fn with_fetch(
        mut self,
        partition: TopicPartition,
        stream_id: StreamId,
        request: FetchRequest,
    ) -> (Self, Option<FetchRequest>) {
        let prior = self
            .fetches
            .entry(partition)
            .or_default()
            .insert(stream_id, request);
        (self, prior)
    }

    /// Removes every key in `partitions` from `fetches`, returning the
    /// removed `FetchRequest`s so the caller can complete them.
    pub fn without_fetches(
        mut self,
        partitions: &std::collections::HashSet<TopicPartition>,
    ) -> (Self, Vec<FetchRequest>) {
        let mut removed = Vec::new();
        for p in partitions {
            if let Some(by_stream) = self.fetches.remove(p) {
                removed.extend(by_stream.into_values());
            }
        }
        (self, removed)
    }

    /// Appends a commit request, respecting `max_pending`. Returns the request
    /// back (as an error completion has already been sent) if the cap is hit.
    pub fn with_pending_commit(
        mut self,
        request: CommitRequest,
        max_pending: usize,
    ) -> Self {
        if self.pending_commits.len() >= max_pending {
            warn!(
                pending = self.pending_commits.len(),
                max_pending, "pending commit queue full, rejecting newest commit"
            );
            let _ = request.completion.send(Err(BrokerError::PendingCommitsFull));
            return self;
        }
        self.pending_commits.push_back(request);
        self
    }

    /// Drains and returns all parked commits.
    pub fn without_pending_commits(mut self) -> (Self, VecDeque<CommitRequest>) {
        let drained = std::mem::take(&mut self.pending_commits);
        (self, drained)
    }

    pub fn with_rebalancing(mut self, rebalancing: bool) -> Self {
        self.rebalancing = rebalancing;
        self
    }

    pub fn as_subscribed(mut self) -> Self {
        self.subscribed = true;
        self
    }

    pub fn as_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn with_on_rebalance(mut self, handler: Arc<dyn RebalanceHandler>) -> Self {
        self.on_rebalances.push(handler);
        self
    }

    pub fn with_in_flight_commit(
        mut self,
        completion: oneshot::Sender<Result<(), BrokerError>>,
    ) -> Self {
        self.in_flight_commits.push_back(completion);
        self
    }

    /// Pops the oldest in-flight commit completion, if any.
    pub fn pop_in_flight_commit(
        mut self,
    ) -> (Self, Option<oneshot::Sender<Result<(), BrokerError>>>) {
        let popped = self.in_flight_commits.pop_front();
        (self, popped)
    }
}

/// A guarded state cell. The actor is single-threaded with respect to State,
/// so a plain mutex swap is enough — no compare-and-swap loop is needed. The
/// cell mainly exists so the rebalance listener (which runs on whatever
/// thread the broker's blocking poll happens to execute on) and the actor's
/// own handlers can both transition State without races.
pub struct StateCell(Mutex<State>);

impl StateCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(State::new())))
    }

    /// Takes the current state out, applies `f`, writes the result back, and
    /// returns whatever extra value `f` produced.
    pub fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(State) -> (State, R),
    {
        let mut guard = self.0.lock();
        let current = std::mem::take(&mut *guard);
        let (next, extra) = f(current);
        *guard = next;
        extra
    }

    /// Read-only snapshot access. Callers must not retain the reference past
    /// the closure, since State is not `Clone`.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&State) -> R,
    {
        let guard = self.0.lock();
        f(&guard)
    }
}
