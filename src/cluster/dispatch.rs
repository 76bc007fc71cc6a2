//! Inbound side of the router: changes relayed to this node by others.

use super::bus::InboundHandler;
use super::membership::MembershipHandler;
use super::router::Router;
use super::Route;
use crate::cache::ReplicatedCache;
use crate::error::{Error, Result};
use crate::metrics::CacheMetrics;
use crate::network::rpc::{
    Envelope, CACHE_REQUEST, CACHE_RESPONSE, ERROR_RESPONSE, MEMBER_REQUEST, MEMBER_RESPONSE, OK,
};
use crate::types::{CacheChangeRecord, MembershipChangeRecord};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Applies relayed changes, or passes them on when this node is not leader.
pub struct InboundDispatcher {
    router: Arc<Router>,
    cache: Arc<ReplicatedCache>,
    /// `None` when membership management is disabled on this node.
    membership: Option<Arc<MembershipHandler>>,
    metrics: Arc<CacheMetrics>,
}

impl InboundDispatcher {
    pub fn new(
        router: Arc<Router>,
        cache: Arc<ReplicatedCache>,
        membership: Option<Arc<MembershipHandler>>,
    ) -> Self {
        let metrics = cache.metrics().clone();
        Self {
            router,
            cache,
            membership,
            metrics,
        }
    }

    /// Where the first attempt runs: here if we lead, otherwise wherever the
    /// router finds the leader. The router falls back to this node when it
    /// turns out to lead after all.
    fn route(&self) -> Route {
        if self.router.is_leader() {
            Route::Local
        } else {
            Route::Redirect
        }
    }

    async fn handle_cache(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        let record = CacheChangeRecord::from_bytes(payload)?;
        debug!(key = %record.key, operation = %record.operation, "Inbound cache change");
        self.cache.submit(record, self.route(), cancel).await
    }

    async fn handle_member(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        let record: MembershipChangeRecord = bincode::deserialize(payload)?;
        debug!(member = %record.member, operation = %record.operation, "Inbound membership change");

        match &self.membership {
            Some(membership) => membership.submit(record, self.route(), cancel).await,
            None => Err(Error::InvalidRequest(
                "membership management is disabled on this node".to_string(),
            )),
        }
    }

    fn wrong_request(message: &Envelope) -> String {
        format!(
            "Wrong request: name = '{}', length = {}",
            message.name,
            message.payload.len()
        )
    }
}

#[async_trait]
impl InboundHandler for InboundDispatcher {
    async fn receive(&self, message: Envelope, cancel: &CancellationToken) -> Envelope {
        self.metrics.inbound_requests.inc();

        let (response, outcome) = match message.name.as_str() {
            CACHE_REQUEST => (CACHE_RESPONSE, self.handle_cache(&message.payload, cancel).await),
            MEMBER_REQUEST => (
                MEMBER_RESPONSE,
                self.handle_member(&message.payload, cancel).await,
            ),
            _ => {
                warn!(name = %message.name, len = message.payload.len(), "Unrecognised inbound request");
                self.metrics.inbound_rejected.inc();
                return Envelope::text(ERROR_RESPONSE, Self::wrong_request(&message));
            }
        };

        match outcome {
            Ok(()) => Envelope::text(response, OK),
            Err(e) => {
                error!(name = %message.name, error = %e, "Failed to process inbound request");
                self.metrics.inbound_rejected.inc();
                Envelope::text(
                    response,
                    format!("Unexpected error while processing the request: {e}"),
                )
            }
        }
    }
}

impl std::fmt::Debug for InboundDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDispatcher")
            .field("router", &self.router)
            .field("membership", &self.membership.is_some())
            .finish()
    }
}
