use envconfig::Envconfig;

/// Broker connection settings, independent of any one consumer instance.
/// Per-consumer behavior lives in [`ConsumerCoreConfig`].
#[derive(Envconfig, Clone, Debug)]
pub struct BrokerConfig {
    #[envconfig(default = "localhost:9092")]
    pub bootstrap_servers: String,

    #[envconfig(default = "false")]
    pub tls: bool,

    #[envconfig(default = "10000")]
    pub statistics_interval_ms: u32,
}

/// Per-actor configuration. `group_id` is optional because a consumer may be
/// constructed before it knows which group it belongs to (e.g. in tests).
#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerCoreConfig {
    pub group_id: Option<String>,

    // We default to "earliest" for this, but if you're bringing up a new consumer
    // group you probably want "latest".
    #[envconfig(default = "earliest")]
    pub offset_reset: String, // earliest, latest

    /// Broker poll blocking cap when demand exists.
    #[envconfig(default = "500")]
    pub poll_timeout_ms: u64,

    /// Cadence at which the poll driver enqueues `Poll` requests.
    #[envconfig(default = "100")]
    pub poll_interval_ms: u64,

    /// External commit race bound at the `message_commit` boundary.
    #[envconfig(default = "10000")]
    pub commit_timeout_ms: u64,

    /// Upper bound on commits parked during a rebalance window, guarding
    /// against unbounded growth under pathological rebalance flapping.
    #[envconfig(default = "10000")]
    pub max_pending_commits: usize,
}

impl ConsumerCoreConfig {
    pub fn poll_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn commit_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.commit_timeout_ms)
    }
}
