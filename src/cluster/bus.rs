//! Point-to-point messaging between cluster members.

use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::Envelope;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The member currently allowed to append to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leader {
    pub endpoint: String,
    /// `false` when the leader is this node.
    pub is_remote: bool,
}

impl Leader {
    pub fn local(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            is_remote: false,
        }
    }

    pub fn remote(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            is_remote: true,
        }
    }
}

/// Receives requests relayed by other members.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle a request and produce the reply. Never fails: problems are
    /// reported in the reply text.
    async fn receive(&self, message: Envelope, cancel: &CancellationToken) -> Envelope;
}

/// Messaging collaborator used by the router.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// This node's endpoint.
    fn local_endpoint(&self) -> String;

    /// The leader as currently known, if any.
    fn leader(&self) -> Option<Leader>;

    /// Send a request to the leader and wait for its reply.
    async fn send_to_leader(
        &self,
        message: Envelope,
        cancel: &CancellationToken,
    ) -> Result<Envelope>;

    /// Register the handler for inbound requests, replacing any previous one.
    fn add_listener(&self, handler: Arc<dyn InboundHandler>);

    /// Stop delivering inbound requests.
    fn remove_listener(&self);
}

/// Bus of a node running alone: it is always its own leader.
pub struct LocalBus {
    endpoint: String,
    listener: RwLock<Option<Arc<dyn InboundHandler>>>,
}

impl LocalBus {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            listener: RwLock::new(None),
        }
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    fn local_endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn leader(&self) -> Option<Leader> {
        Some(Leader::local(self.endpoint.clone()))
    }

    async fn send_to_leader(
        &self,
        message: Envelope,
        cancel: &CancellationToken,
    ) -> Result<Envelope> {
        let listener = self.listener.read().clone();
        match listener {
            Some(handler) => Ok(handler.receive(message, cancel).await),
            None => Err(Error::Network(NetworkError::ConnectionFailed {
                addr: self.endpoint.clone(),
                reason: "no inbound listener registered".to_string(),
            })),
        }
    }

    fn add_listener(&self, handler: Arc<dyn InboundHandler>) {
        *self.listener.write() = Some(handler);
    }

    fn remove_listener(&self) {
        *self.listener.write() = None;
    }
}

impl std::fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBus")
            .field("endpoint", &self.endpoint)
            .field("listening", &self.listener.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::{CACHE_REQUEST, CACHE_RESPONSE, OK};

    struct Echo;

    #[async_trait]
    impl InboundHandler for Echo {
        async fn receive(&self, message: Envelope, _cancel: &CancellationToken) -> Envelope {
            assert_eq!(message.name, CACHE_REQUEST);
            Envelope::text(CACHE_RESPONSE, OK)
        }
    }

    #[tokio::test]
    async fn test_local_bus_is_its_own_leader() {
        let bus = LocalBus::new("https://127.0.0.1:3092");
        let leader = bus.leader().unwrap();
        assert!(!leader.is_remote);
        assert_eq!(leader.endpoint, bus.local_endpoint());
    }

    #[tokio::test]
    async fn test_local_bus_loops_back_to_listener() {
        let bus = LocalBus::new("https://127.0.0.1:3092");
        let cancel = CancellationToken::new();

        assert!(bus
            .send_to_leader(Envelope::new(CACHE_REQUEST, vec![]), &cancel)
            .await
            .is_err());

        bus.add_listener(Arc::new(Echo));
        let reply = bus
            .send_to_leader(Envelope::new(CACHE_REQUEST, vec![]), &cancel)
            .await
            .unwrap();
        assert!(reply.is_ok());

        bus.remove_listener();
        assert!(bus
            .send_to_leader(Envelope::new(CACHE_REQUEST, vec![]), &cancel)
            .await
            .is_err());
    }
}
