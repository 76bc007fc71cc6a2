//! In-process simulated cluster.
//!
//! Every node owns a [`MemoryLog`]. The leader ships its log to the other
//! members on `force_replicate` and commits everyone on `wait_for_commit`.
//! Term and leadership are shared cluster-wide so tests can move them, and
//! each node's log carries injectable replication faults.

use crate::cache::CacheParts;
use crate::cluster::bus::{InboundHandler, Leader, MessageBus};
use crate::config::NodeConfig;
use crate::consensus::{MemoryLog, ReplicatedLog, Replicator};
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::Envelope;
use crate::node::{CacheNode, Collaborators};
use crate::types::{normalize_endpoint, LogIndex, Term};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Replication faults injected into one node's log.
#[derive(Debug, Default)]
pub struct Faults {
    /// Fail this many `force_replicate` calls.
    fail_replications: AtomicU32,
    /// Start a new term during this many `force_replicate` calls.
    term_changes: AtomicU32,
    /// Block `force_replicate` until cancelled or timed out.
    hang: AtomicBool,
    /// Sleep before replicating.
    delay: Mutex<Option<Duration>>,
    /// Calls to `force_replicate` seen so far.
    replications: AtomicU32,
}

impl Faults {
    pub fn fail_next(&self, count: u32) {
        self.fail_replications.store(count, Ordering::SeqCst);
    }

    pub fn change_term_next(&self, count: u32) {
        self.term_changes.store(count, Ordering::SeqCst);
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn replications(&self) -> u32 {
        self.replications.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// State shared by every node of a simulated cluster.
#[derive(Default)]
struct Shared {
    term: AtomicU64,
    leader: RwLock<Option<String>>,
    logs: RwLock<HashMap<String, Arc<MemoryLog>>>,
    handlers: RwLock<HashMap<String, Arc<dyn InboundHandler>>>,
}

impl Shared {
    fn log(&self, endpoint: &str) -> Option<Arc<MemoryLog>> {
        self.logs.read().get(endpoint).cloned()
    }
}

/// One node's view of the simulated log.
pub struct SimLog {
    endpoint: String,
    log: Arc<MemoryLog>,
    shared: Arc<Shared>,
    faults: Arc<Faults>,
    /// Replication targets; every other node until membership is attached.
    members: Mutex<Option<watch::Receiver<Vec<String>>>>,
}

impl SimLog {
    fn followers(&self) -> Vec<(String, Arc<MemoryLog>)> {
        let targets: Vec<String> = match &*self.members.lock() {
            Some(members) => members.borrow().clone(),
            None => self.shared.logs.read().keys().cloned().collect(),
        };

        targets
            .into_iter()
            .filter(|endpoint| !endpoint.eq_ignore_ascii_case(&self.endpoint))
            .filter_map(|endpoint| {
                let log = self.shared.log(&endpoint)?;
                Some((endpoint, log))
            })
            .collect()
    }

    fn sync_term(&self) {
        self.log.set_term(self.shared.term.load(Ordering::SeqCst));
    }
}

#[async_trait]
impl ReplicatedLog for SimLog {
    async fn append(&self, data: Bytes, cancel: &CancellationToken) -> Result<LogIndex> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.sync_term();
        Ok(self.log.append_entry(data))
    }

    async fn wait_for_commit(
        &self,
        index: LogIndex,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.log.commit_to(index).await;

        for (endpoint, follower) in self.followers() {
            match follower.replicate_from(&self.log) {
                Ok(_) => follower.commit_to(index).await,
                Err(e) => debug!(follower = %endpoint, error = %e, "Follower not caught up"),
            }
        }

        self.log.await_commit(index, timeout, cancel).await
    }

    async fn drop_uncommitted(&self, index: LogIndex, _cancel: &CancellationToken) -> Result<bool> {
        Ok(self.log.truncate_from(index))
    }

    fn term(&self) -> Term {
        self.shared.term.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Replicator for SimLog {
    async fn force_replicate(&self, timeout: Duration, cancel: &CancellationToken) -> Result<bool> {
        self.faults.replications.fetch_add(1, Ordering::SeqCst);

        let delay = *self.faults.delay.lock();
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.faults.hang.load(Ordering::SeqCst) {
            return tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                _ = tokio::time::sleep(timeout) => Ok(false),
            };
        }

        if Faults::take(&self.faults.fail_replications) {
            debug!(endpoint = %self.endpoint, "Injected replication failure");
            return Ok(false);
        }

        if Faults::take(&self.faults.term_changes) {
            let term = self.shared.term.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(endpoint = %self.endpoint, term, "Injected term change");
            return Ok(true);
        }

        for (endpoint, follower) in self.followers() {
            if let Err(e) = follower.replicate_from(&self.log) {
                debug!(follower = %endpoint, error = %e, "Replication to follower failed");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Message bus delivering requests to the leader's handler in-process.
pub struct SimBus {
    endpoint: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl MessageBus for SimBus {
    fn local_endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn leader(&self) -> Option<Leader> {
        self.shared.leader.read().as_ref().map(|leader| Leader {
            endpoint: leader.clone(),
            is_remote: !leader.eq_ignore_ascii_case(&self.endpoint),
        })
    }

    async fn send_to_leader(&self, message: Envelope, cancel: &CancellationToken) -> Result<Envelope> {
        let leader = self
            .shared
            .leader
            .read()
            .clone()
            .ok_or_else(|| Error::Internal("no leader to send to".to_string()))?;

        let handler = self.shared.handlers.read().get(&leader).cloned();
        match handler {
            Some(handler) => Ok(handler.receive(message, cancel).await),
            None => Err(NetworkError::ConnectionFailed {
                addr: leader,
                reason: "node is not listening".to_string(),
            }
            .into()),
        }
    }

    fn add_listener(&self, handler: Arc<dyn InboundHandler>) {
        self.shared
            .handlers
            .write()
            .insert(self.endpoint.clone(), handler);
    }

    fn remove_listener(&self) {
        self.shared.handlers.write().remove(&self.endpoint);
    }
}

/// A simulated node.
pub struct SimNode {
    pub node: CacheNode,
    pub log: Arc<MemoryLog>,
    pub faults: Arc<Faults>,
}

impl std::ops::Deref for SimNode {
    type Target = CacheNode;

    fn deref(&self) -> &CacheNode {
        &self.node
    }
}

/// A cluster of [`SimNode`]s, led by the first one.
pub struct SimCluster {
    shared: Arc<Shared>,
    pub nodes: Vec<SimNode>,
}

impl SimCluster {
    /// Build `size` nodes with membership enabled and start them.
    pub async fn start(size: usize) -> Self {
        Self::start_with(size, |config| config).await
    }

    /// Build and start `size` nodes, adjusting each node's configuration.
    pub async fn start_with<F>(size: usize, configure: F) -> Self
    where
        F: Fn(NodeConfig) -> NodeConfig,
    {
        let shared = Arc::new(Shared {
            term: AtomicU64::new(1),
            ..Default::default()
        });

        let endpoints: Vec<String> = (0..size)
            .map(|i| normalize_endpoint(&format!("sim-node-{i}:3092")))
            .collect();
        *shared.leader.write() = endpoints.first().cloned();

        let mut nodes = Vec::with_capacity(size);
        for endpoint in &endpoints {
            let config = configure(
                NodeConfig::new(endpoint)
                    .with_members(&endpoints)
                    .with_membership_enabled(true),
            );

            let parts = CacheParts::new(&config.storage);
            let log = Arc::new(MemoryLog::new(Arc::new(parts.state_machine())));
            shared.logs.write().insert(endpoint.clone(), log.clone());

            let faults = Arc::new(Faults::default());
            let sim_log = Arc::new(SimLog {
                endpoint: endpoint.clone(),
                log: log.clone(),
                shared: shared.clone(),
                faults: faults.clone(),
                members: Mutex::new(None),
            });
            let bus = Arc::new(SimBus {
                endpoint: endpoint.clone(),
                shared: shared.clone(),
            });

            let node = CacheNode::build(
                config,
                parts,
                Collaborators {
                    bus,
                    log: sim_log.clone(),
                    replicator: Some(sim_log.clone()),
                },
            )
            .expect("valid simulated node configuration");

            if let Some(membership) = node.membership_handler() {
                *sim_log.members.lock() = Some(membership.subscribe());
            }

            nodes.push(SimNode { node, log, faults });
        }

        let cancel = CancellationToken::new();
        for node in &nodes {
            node.start(&cancel).await.expect("node start");
        }

        Self { shared, nodes }
    }

    pub fn leader(&self) -> &SimNode {
        let leader = self.shared.leader.read().clone();
        self.nodes
            .iter()
            .find(|n| Some(n.endpoint()) == leader.as_deref())
            .unwrap_or(&self.nodes[0])
    }

    pub fn node(&self, index: usize) -> &SimNode {
        &self.nodes[index]
    }

    /// Hand leadership to node `index`, or to nobody.
    pub fn set_leader(&self, index: Option<usize>) {
        *self.shared.leader.write() = index.map(|i| self.nodes[i].endpoint().to_string());
    }

    pub fn term(&self) -> Term {
        self.shared.term.load(Ordering::SeqCst)
    }

    /// Stop followers first so that their departure reaches the leader.
    pub async fn stop(&self) {
        for node in self.nodes.iter().rev() {
            node.stop().await;
        }
    }
}
