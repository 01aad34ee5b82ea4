pub mod actor;
pub mod broker;
pub mod commit_recovery;
pub mod config;
pub mod error;
pub mod poll_driver;
pub mod rebalance;
pub mod request;
pub mod state;
pub mod types;

pub use actor::spawn;
pub use commit_recovery::{CommitRecovery, NeverRetry, RecoveryDecision, RetryUpTo};
pub use config::{BrokerConfig, ConsumerCoreConfig};
pub use error::{BrokerError, ConsumerCoreError};
pub use poll_driver::spawn_poll_driver;
pub use rebalance::RebalanceHandler;
pub use request::{ActorHandle, Request};
pub use types::{no_record_metadata, FetchReason, Record, StreamId, TopicPartition};
