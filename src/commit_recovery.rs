use std::collections::HashMap;

use crate::types::TopicPartition;

/// What `message_commit` should do after a commit failed or timed out.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RecoveryDecision {
    /// Re-submit the same offsets through the actor once more.
    Retry,
    /// Give up and surface the original error to the caller.
    Drop,
}

/// Pluggable policy invoked by `message_commit` when a commit times out or
/// the broker reports a failure. Kept as a trait (rather than a bare closure
/// type alias) so implementations can carry their own state — a retry
/// counter, a circuit breaker, metrics handles — the way `RebalanceHandler`
/// does.
pub trait CommitRecovery: Send + Sync {
    fn recover(
        &self,
        offsets: &HashMap<TopicPartition, (i64, Option<String>)>,
        attempt: u32,
    ) -> RecoveryDecision;
}

/// The conservative default: never retry. A commit failure or timeout is
/// surfaced immediately; offset commits resume on the next successful
/// `message_commit` call, so silently dropping one is safe (it just delays
/// how far the committed offset advances).
pub struct NeverRetry;

impl CommitRecovery for NeverRetry {
    fn recover(
        &self,
        _offsets: &HashMap<TopicPartition, (i64, Option<String>)>,
        _attempt: u32,
    ) -> RecoveryDecision {
        RecoveryDecision::Drop
    }
}

/// Retries a fixed number of times before giving up.
pub struct RetryUpTo {
    pub max_attempts: u32,
}

impl CommitRecovery for RetryUpTo {
    fn recover(
        &self,
        _offsets: &HashMap<TopicPartition, (i64, Option<String>)>,
        attempt: u32,
    ) -> RecoveryDecision {
        if attempt < self.max_attempts {
            RecoveryDecision::Retry
        } else {
            RecoveryDecision::Drop
        }
    }
}
