//! Configuration types for the replicated cache.

use crate::types::normalize_endpoint;
use std::time::Duration;

/// Main configuration for a cache node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's endpoint, normalized to include a scheme.
    pub endpoint: String,

    /// Initial cluster members (endpoints), possibly including this node.
    pub members: Vec<String>,

    /// Whether this node manages cluster membership.
    pub membership_enabled: bool,

    /// Local store configuration.
    pub storage: StorageConfig,

    /// Write path configuration.
    pub replication: ReplicationConfig,

    /// Leader redirection configuration.
    pub router: RouterConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            endpoint: normalize_endpoint("127.0.0.1:3092"),
            members: Vec::new(),
            membership_enabled: false,
            storage: StorageConfig::default(),
            replication: ReplicationConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a new configuration for the given endpoint.
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: normalize_endpoint(endpoint),
            ..Default::default()
        }
    }

    /// Set the initial cluster members.
    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.members = members
            .into_iter()
            .map(|m| normalize_endpoint(m.as_ref()))
            .collect();
        self
    }

    /// Enable or disable membership management.
    pub fn with_membership_enabled(mut self, enabled: bool) -> Self {
        self.membership_enabled = enabled;
        self
    }

    /// Set maximum cache capacity.
    pub fn with_max_capacity(mut self, capacity: u64) -> Self {
        self.storage.max_capacity = capacity;
        self
    }

    /// Set how many applied log entries are kept before compaction.
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.storage.compaction_threshold = threshold;
        self
    }

    /// Set replication configuration.
    pub fn with_replication_config(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    /// Set router configuration.
    pub fn with_router_config(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// Set the commit timeout.
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.replication.commit_timeout = timeout;
        self
    }

    /// Set how long the router waits for a leader to be elected.
    pub fn with_leader_wait_timeout(mut self, timeout: Duration) -> Self {
        self.router.leader_wait_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage.max_capacity == 0 {
            return Err(crate::Error::Config(
                "max_capacity must be greater than zero".to_string(),
            ));
        }
        if self.storage.compaction_threshold == 0 {
            return Err(crate::Error::Config(
                "compaction_threshold must be greater than zero".to_string(),
            ));
        }
        if self.router.leader_check_interval.is_zero() {
            return Err(crate::Error::Config(
                "leader_check_interval must be greater than zero".to_string(),
            ));
        }
        if self.router.leader_check_interval > self.router.leader_wait_timeout {
            return Err(crate::Error::Config(
                "leader_check_interval must not exceed leader_wait_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

/// Local store configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Maximum number of entries kept in memory.
    pub max_capacity: u64,

    /// Applied log entries retained before the log compacts them into a
    /// snapshot. Applies to the in-memory log of standalone nodes.
    pub compaction_threshold: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
            compaction_threshold: 50,
        }
    }
}

/// Write path configuration.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Budget for a forced replication round.
    pub replicate_timeout: Duration,

    /// Budget for an appended entry to commit after replication.
    pub commit_timeout: Duration,

    /// Pause between attempts after a rolled back write.
    pub retry_backoff: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replicate_timeout: Duration::from_secs(30),
            commit_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Leader redirection configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long to wait for a leader before giving up.
    pub leader_wait_timeout: Duration,

    /// Polling interval while no leader is known.
    pub leader_check_interval: Duration,

    /// Budget for a relayed request to be answered.
    pub request_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            leader_wait_timeout: Duration::from_secs(5),
            leader_check_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
        }
    }
}
