//! A cache node: the engine, the router and the membership handler wired
//! over one message bus and one replicated log.

use crate::cache::storage::CacheStats;
use crate::cache::{CacheParts, ReplicatedCache};
use crate::cluster::{
    InboundDispatcher, LocalBus, LoggingEventListener, MemberList, MembershipHandler,
    MessageBus, Router,
};
use crate::config::{NodeConfig, StorageConfig};
use crate::consensus::{MemoryLog, ReplicatedLog, Replicator};
use crate::error::{Error, Result};
use crate::metrics::CacheMetrics;
use crate::types::{ExpirationPolicy, NodeStatus};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts made to announce this node to the cluster on start.
const SELF_JOIN_ATTEMPTS: u32 = 3;

/// Pause between self-join attempts.
const SELF_JOIN_DELAY: Duration = Duration::from_millis(300);

/// External collaborators a node runs on.
#[derive(Clone)]
pub struct Collaborators {
    pub bus: Arc<dyn MessageBus>,
    pub log: Arc<dyn ReplicatedLog>,
    /// `None` for a node whose log commits on append.
    pub replicator: Option<Arc<dyn Replicator>>,
}

/// Single-voter log feeding `parts`, compacting past the configured threshold.
pub(crate) fn standalone_log(storage: &StorageConfig, parts: &CacheParts) -> Arc<MemoryLog> {
    Arc::new(
        MemoryLog::new(Arc::new(parts.state_machine()))
            .with_compaction_threshold(storage.compaction_threshold),
    )
}

/// One member of the replicated cache.
pub struct CacheNode {
    config: NodeConfig,
    cache: Arc<ReplicatedCache>,
    router: Arc<Router>,
    membership: Option<Arc<MembershipHandler>>,
    dispatcher: Arc<InboundDispatcher>,
    running: AtomicBool,
}

impl CacheNode {
    /// A node that is its own leader, backed by an in-memory log.
    pub fn standalone(config: NodeConfig) -> Result<Self> {
        let parts = CacheParts::new(&config.storage);
        let log = standalone_log(&config.storage, &parts);
        let bus = Arc::new(LocalBus::new(config.endpoint.clone()));

        Self::build(
            config,
            parts,
            Collaborators {
                bus,
                log,
                replicator: None,
            },
        )
    }

    /// Wire a node over the given collaborators.
    ///
    /// The log must deliver committed entries to `parts.state_machine()`.
    pub fn build(config: NodeConfig, parts: CacheParts, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let metrics = parts.metrics.clone();
        let router = Arc::new(Router::new(collaborators.bus, config.router.clone()));

        let mut cache = ReplicatedCache::new(parts, collaborators.log, config.replication.clone())
            .with_redirector(router.clone());
        if let Some(replicator) = collaborators.replicator {
            cache = cache.with_replicator(replicator);
        }
        let cache = Arc::new(cache);

        let membership = config.membership_enabled.then(|| {
            let members: MemberList = config.members.iter().collect();
            let handler = MembershipHandler::new(members, metrics).with_redirector(router.clone());
            handler.add_listener(Arc::new(LoggingEventListener));
            Arc::new(handler)
        });

        let dispatcher = Arc::new(InboundDispatcher::new(
            router.clone(),
            cache.clone(),
            membership.clone(),
        ));

        Ok(Self {
            config,
            cache,
            router,
            membership,
            dispatcher,
            running: AtomicBool::new(false),
        })
    }

    /// Start receiving relayed changes and, with membership enabled,
    /// announce this node to the cluster.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(endpoint = %self.config.endpoint, "Starting cache node");
        self.router.bus().add_listener(self.dispatcher.clone());

        if let Some(membership) = &self.membership {
            self.join(membership, cancel).await;
        }

        info!(endpoint = %self.config.endpoint, "Cache node started");
        Ok(())
    }

    async fn join(&self, membership: &MembershipHandler, cancel: &CancellationToken) {
        for attempt in 1..=SELF_JOIN_ATTEMPTS {
            match membership.add(&self.config.endpoint, cancel).await {
                Ok(()) => {
                    debug!(endpoint = %self.config.endpoint, attempt, "Joined cluster");
                    return;
                }
                Err(Error::Cancelled) => return,
                Err(e) => {
                    warn!(endpoint = %self.config.endpoint, attempt, error = %e, "Failed to join cluster");
                    if attempt < SELF_JOIN_ATTEMPTS {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(SELF_JOIN_DELAY) => {}
                        }
                    }
                }
            }
        }

        error!(
            endpoint = %self.config.endpoint,
            attempts = SELF_JOIN_ATTEMPTS,
            "Could not add this node to the cluster"
        );
    }

    /// Leave the cluster, stop receiving relayed changes and wait for
    /// in-flight changes to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(endpoint = %self.config.endpoint, "Stopping cache node");

        if let Some(membership) = &self.membership {
            let cancel = CancellationToken::new();
            let leave = membership.remove(&self.config.endpoint, &cancel);
            match tokio::time::timeout(self.config.router.request_timeout, leave).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(endpoint = %self.config.endpoint, error = %e, "Failed to leave cluster");
                }
                Err(_) => {
                    cancel.cancel();
                    warn!(endpoint = %self.config.endpoint, "Timed out leaving cluster");
                }
            }
        }

        self.router.bus().remove_listener();
        self.cache.shutdown().await;

        info!(endpoint = %self.config.endpoint, "Cache node stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ==================== Cache operations ====================

    /// Read `key` from this node's local store.
    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Option<Bytes>> {
        self.cache.get(key, cancel).await
    }

    pub async fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        expiration: Option<ExpirationPolicy>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.cache.set(key, value, expiration, cancel).await
    }

    pub async fn remove(&self, key: impl Into<String>, cancel: &CancellationToken) -> Result<()> {
        self.cache.remove(key, cancel).await
    }

    pub async fn refresh(&self, key: impl Into<String>, cancel: &CancellationToken) -> Result<()> {
        self.cache.refresh(key, cancel).await
    }

    // ==================== Membership ====================

    /// Add a member to the cluster.
    pub async fn add_member(&self, member: &str, cancel: &CancellationToken) -> Result<()> {
        self.membership()?.add(member, cancel).await
    }

    /// Remove a member from the cluster.
    pub async fn remove_member(&self, member: &str, cancel: &CancellationToken) -> Result<()> {
        self.membership()?.remove(member, cancel).await
    }

    /// Known members; empty when membership is disabled.
    pub fn members(&self) -> Vec<String> {
        self.membership
            .as_ref()
            .map(|m| m.members())
            .unwrap_or_default()
    }

    fn membership(&self) -> Result<&Arc<MembershipHandler>> {
        self.membership.as_ref().ok_or_else(|| {
            Error::Config("membership management is disabled on this node".to_string())
        })
    }

    pub fn membership_handler(&self) -> Option<&Arc<MembershipHandler>> {
        self.membership.as_ref()
    }

    // ==================== Status ====================

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn is_leader(&self) -> bool {
        self.router.is_leader()
    }

    pub fn status(&self) -> NodeStatus {
        let leader = self.router.bus().leader();
        NodeStatus {
            endpoint: self.config.endpoint.clone(),
            is_leader: leader.as_ref().is_some_and(|l| !l.is_remote),
            leader: leader.map(|l| l.endpoint),
            term: self.cache.term(),
            members: self.members(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        self.cache.metrics()
    }

    pub fn cache(&self) -> &Arc<ReplicatedCache> {
        &self.cache
    }
}

impl std::fmt::Debug for CacheNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("endpoint", &self.config.endpoint)
            .field("running", &self.is_running())
            .field("cache", &self.cache)
            .finish()
    }
}
