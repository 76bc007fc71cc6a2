//! Leader redirection.
//!
//! The router decides, per change, whether this node is the leader and can
//! apply it, or whether it must relay the change to whichever node is.

use super::bus::{Leader, MessageBus};
use super::Redirector;
use crate::config::RouterConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{
    Envelope, CACHE_REQUEST, CACHE_RESPONSE, MEMBER_REQUEST, MEMBER_RESPONSE,
};
use crate::types::{CacheChangeRecord, MembershipChangeRecord};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A change the router can relay.
pub trait RoutedRecord: Serialize + Send + Sync {
    /// Message name of the relayed request.
    const REQUEST: &'static str;
    /// Message name the leader answers with.
    const RESPONSE: &'static str;

    /// Operation name for diagnostics.
    fn operation(&self) -> String;

    /// Subject of the change (cache key or member) for diagnostics.
    fn subject(&self) -> &str;
}

impl RoutedRecord for CacheChangeRecord {
    const REQUEST: &'static str = CACHE_REQUEST;
    const RESPONSE: &'static str = CACHE_RESPONSE;

    fn operation(&self) -> String {
        self.operation.to_string()
    }

    fn subject(&self) -> &str {
        &self.key
    }
}

impl RoutedRecord for MembershipChangeRecord {
    const REQUEST: &'static str = MEMBER_REQUEST;
    const RESPONSE: &'static str = MEMBER_RESPONSE;

    fn operation(&self) -> String {
        self.operation.to_string()
    }

    fn subject(&self) -> &str {
        &self.member
    }
}

/// Relays changes to the leader over the message bus.
pub struct Router {
    bus: Arc<dyn MessageBus>,
    config: RouterConfig,
}

impl Router {
    pub fn new(bus: Arc<dyn MessageBus>, config: RouterConfig) -> Self {
        Self { bus, config }
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Whether this node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        matches!(self.bus.leader(), Some(leader) if !leader.is_remote)
    }

    /// Wait for a leader to be known, polling at the check interval.
    pub async fn look_for_leader(&self, cancel: &CancellationToken) -> Result<Leader> {
        let started = Instant::now();

        loop {
            if let Some(leader) = self.bus.leader() {
                return Ok(leader);
            }

            if started.elapsed() >= self.config.leader_wait_timeout {
                return Err(Error::LeaderDiscoveryTimeout {
                    waited: self.config.leader_wait_timeout,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.leader_check_interval) => {}
            }
        }
    }

    /// Relay `record` to the leader.
    ///
    /// Returns `false` without sending anything when this node is the
    /// leader. Returns `true` when the leader answered `OK`; any other
    /// answer is a [`Error::Redirection`].
    pub async fn forward<R: RoutedRecord>(
        &self,
        record: &R,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let leader = self.look_for_leader(cancel).await?;
        if !leader.is_remote {
            return Ok(false);
        }

        let request = Envelope::new(R::REQUEST, bincode::serialize(record)?);
        debug!(
            leader = %leader.endpoint,
            operation = %record.operation(),
            subject = %record.subject(),
            "Relaying change to leader"
        );

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            sent = tokio::time::timeout(
                self.config.request_timeout,
                self.bus.send_to_leader(request, cancel),
            ) => sent,
        };

        let reply = match sent {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(NetworkError::Timeout {
                    addr: leader.endpoint,
                    after: self.config.request_timeout,
                }
                .into())
            }
        };

        if reply.name != R::RESPONSE {
            warn!(
                expected = R::RESPONSE,
                received = %reply.name,
                "Unexpected reply name from leader"
            );
        }

        if reply.is_ok() {
            Ok(true)
        } else {
            let text = reply.as_text();
            warn!(
                leader = %leader.endpoint,
                operation = %record.operation(),
                subject = %record.subject(),
                reply = %text,
                "Leader rejected change"
            );
            Err(Error::Redirection {
                operation: record.operation(),
                key: record.subject().to_string(),
                reply: text,
            })
        }
    }
}

#[async_trait]
impl Redirector<CacheChangeRecord> for Router {
    async fn redirect(&self, record: &CacheChangeRecord, cancel: &CancellationToken) -> Result<bool> {
        self.forward(record, cancel).await
    }
}

#[async_trait]
impl Redirector<MembershipChangeRecord> for Router {
    async fn redirect(
        &self,
        record: &MembershipChangeRecord,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.forward(record, cancel).await
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("endpoint", &self.bus.local_endpoint())
            .field("leader", &self.bus.leader())
            .finish()
    }
}
