use std::collections::HashSet;
use std::sync::Arc;

use rdkafka::consumer::{ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{info, warn};

use crate::state::StateCell;
use crate::types::TopicPartition;

/// Registered by a downstream consumer via an `Assignment` request. Plain
/// synchronous methods, not `async_trait`: the broker invokes these on the
/// thread running `poll`, and they must return before `poll` does.
pub trait RebalanceHandler: Send + Sync {
    fn on_partitions_assigned(&self, assigned: &HashSet<TopicPartition>) {
        let _ = assigned;
    }

    fn on_partitions_revoked(&self, revoked: &HashSet<TopicPartition>) {
        let _ = revoked;
    }
}

fn to_topic_partitions(tpl: &TopicPartitionList) -> HashSet<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition()))
        .collect()
}

/// `rdkafka::ClientContext`/`ConsumerContext` implementation backing the
/// broker's rebalance listener. Invoked synchronously, inline, inside
/// `BaseConsumer::poll` — so it mutates the shared `StateCell` directly
/// rather than sending a request back through the actor's queue (which would
/// deadlock: the actor is what's blocked inside that very `poll` call).
pub struct RebalanceContext {
    state: Arc<StateCell>,
}

impl RebalanceContext {
    pub fn new(state: Arc<StateCell>) -> Self {
        Self { state }
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let revoked = to_topic_partitions(tpl);
            info!(?revoked, "revoked-partitions");

            let (removed, hooks) = self.state.update(|state| {
                let (state, removed) = state.with_rebalancing(true).without_fetches(&revoked);
                let hooks = state.on_rebalances.clone();
                (state, (removed, hooks))
            });

            if removed.is_empty() {
                info!(?revoked, "revoked-fetches-without-records");
            }
            for fetch in removed {
                fetch.complete_revoked();
            }
            for hook in hooks {
                hook.on_partitions_revoked(&revoked);
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let assigned = to_topic_partitions(tpl);
            info!(?assigned, "assigned-partitions");

            let hooks = self
                .state
                .update(|state| {
                    let state = state.with_rebalancing(false);
                    let hooks = state.on_rebalances.clone();
                    (state, hooks)
                });

            for hook in hooks {
                hook.on_partitions_assigned(&assigned);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        let completion = self.state.update(|state| state.pop_in_flight_commit());

        let Some(completion) = completion else {
            if let Err(err) = result {
                warn!(error = %err, "kafka reported a commit callback with no in-flight commit waiting on it");
            }
            return;
        };

        let _ = completion.send(result.map_err(Into::into));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::oneshot;

    use crate::state::FetchRequest;
    use crate::types::{FetchReason, TopicPartition};

    use super::*;

    fn tpl(partitions: &[(&str, i32)]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for (topic, partition) in partitions {
            tpl.add_partition(topic, *partition);
        }
        tpl
    }

    #[derive(Default)]
    struct RecordingHandler {
        revoked_calls: Mutex<Vec<HashSet<TopicPartition>>>,
        assigned_calls: Mutex<Vec<HashSet<TopicPartition>>>,
    }

    impl RebalanceHandler for RecordingHandler {
        fn on_partitions_revoked(&self, revoked: &HashSet<TopicPartition>) {
            self.revoked_calls.lock().unwrap().push(revoked.clone());
        }

        fn on_partitions_assigned(&self, assigned: &HashSet<TopicPartition>) {
            self.assigned_calls.lock().unwrap().push(assigned.clone());
        }
    }

    #[tokio::test]
    async fn revoke_completes_outstanding_fetches_and_sets_rebalancing() {
        let state = StateCell::new();
        let (tx, rx) = oneshot::channel();
        state.update(|s| {
            (
                s.with_fetch(TopicPartition::new("t", 0), 1, FetchRequest::new(tx)).0,
                (),
            )
        });

        let context = RebalanceContext::new(state.clone());
        context.pre_rebalance(&Rebalance::Revoke(&tpl(&[("t", 0)])));

        let (records, reason) = rx.await.unwrap();
        assert_eq!(reason, FetchReason::TopicPartitionRevoked);
        assert!(records.is_empty());
        state.with(|s| {
            assert!(!s.fetches.contains_key(&TopicPartition::new("t", 0)));
            assert!(s.rebalancing);
        });
    }

    #[tokio::test]
    async fn revoke_only_affects_revoked_partitions() {
        let state = StateCell::new();
        let (tx0, _rx0) = oneshot::channel();
        let (tx1, rx1) = oneshot::channel();
        state.update(|s| {
            let (s, _) = s.with_fetch(TopicPartition::new("t", 0), 1, FetchRequest::new(tx0));
            let (s, _) = s.with_fetch(TopicPartition::new("t", 1), 1, FetchRequest::new(tx1));
            (s, ())
        });

        let context = RebalanceContext::new(state.clone());
        context.pre_rebalance(&Rebalance::Revoke(&tpl(&[("t", 0)])));

        state.with(|s| {
            assert!(!s.fetches.contains_key(&TopicPartition::new("t", 0)));
            assert!(s.fetches.contains_key(&TopicPartition::new("t", 1)));
        });
        // t-1's fetch is untouched, so its receiver must still be pending.
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn revoked_fetches_complete_before_on_revoked_hook_runs() {
        let state = StateCell::new();
        let (tx, rx) = oneshot::channel::<(std::sync::Arc<[crate::types::Record]>, FetchReason)>();
        state.update(|s| {
            (
                s.with_fetch(TopicPartition::new("t", 0), 1, FetchRequest::new(tx)).0,
                (),
            )
        });

        let handler = Arc::new(RecordingHandler::default());
        state.update(|s| (s.with_on_rebalance(handler.clone()), ()));

        let context = RebalanceContext::new(state.clone());
        context.pre_rebalance(&Rebalance::Revoke(&tpl(&[("t", 0)])));

        // The fetch's completion must already be observable once `pre_rebalance`
        // returns, i.e. strictly before the hook synchronously invoked inside it
        // could have raced the completion.
        assert!(rx.await.is_ok());
        assert_eq!(handler.revoked_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn assign_clears_rebalancing_and_invokes_hooks_in_order() {
        let state = StateCell::new();
        state.update(|s| (s.with_rebalancing(true), ()));

        let first = Arc::new(RecordingHandler::default());
        let second = Arc::new(RecordingHandler::default());
        state.update(|s| {
            let s = s.with_on_rebalance(first.clone());
            (s.with_on_rebalance(second.clone()), ())
        });

        let context = RebalanceContext::new(state.clone());
        context.post_rebalance(&Rebalance::Assign(&tpl(&[("t", 0), ("t", 1)])));

        state.with(|s| assert!(!s.rebalancing));
        assert_eq!(first.assigned_calls.lock().unwrap().len(), 1);
        assert_eq!(second.assigned_calls.lock().unwrap().len(), 1);
        let assigned = &first.assigned_calls.lock().unwrap()[0];
        assert!(assigned.contains(&TopicPartition::new("t", 0)));
        assert!(assigned.contains(&TopicPartition::new("t", 1)));
    }

    #[tokio::test]
    async fn commit_callback_completes_oldest_in_flight_commit_first() {
        let state = StateCell::new();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        state.update(|s| (s.with_in_flight_commit(tx_a), ()));
        state.update(|s| (s.with_in_flight_commit(tx_b), ()));

        let context = RebalanceContext::new(state.clone());
        context.commit_callback(Ok(()), &TopicPartitionList::new());
        context.commit_callback(Ok(()), &TopicPartitionList::new());

        assert!(rx_a.await.unwrap().is_ok());
        assert!(rx_b.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn commit_callback_with_no_in_flight_commit_does_not_panic() {
        let state = StateCell::new();
        let context = RebalanceContext::new(state);
        context.commit_callback(Ok(()), &TopicPartitionList::new());
    }
}
