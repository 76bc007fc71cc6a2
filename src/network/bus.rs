//! Message bus over TCP.
//!
//! Each node listens on its endpoint's `host:port`. Leadership is not
//! decided here: the consensus collaborator reports it through a
//! [`LeaderTracker`].

use super::rpc::{frame_message, Envelope};
use super::server::{read_frame, InboundSlot, NetworkServer};
use crate::cluster::bus::{InboundHandler, Leader, MessageBus};
use crate::error::{Error, NetworkError, Result};
use crate::types::{endpoint_authority, normalize_endpoint, DEFAULT_SCHEME};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shared view of who currently leads, fed by the consensus collaborator.
#[derive(Debug, Clone)]
pub struct LeaderTracker {
    local: String,
    leader: Arc<RwLock<Option<String>>>,
}

impl LeaderTracker {
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            leader: Arc::new(RwLock::new(None)),
        }
    }

    /// Record the current leader, or `None` during an election.
    pub fn set_leader(&self, endpoint: Option<&str>) {
        let leader = endpoint.map(normalize_endpoint);
        debug!(leader = ?leader, "Leader changed");
        *self.leader.write() = leader;
    }

    pub fn leader(&self) -> Option<Leader> {
        self.leader.read().as_ref().map(|endpoint| Leader {
            endpoint: endpoint.clone(),
            is_remote: !endpoint.eq_ignore_ascii_case(&self.local),
        })
    }
}

/// [`MessageBus`] carrying framed envelopes over TCP.
pub struct TcpMessageBus {
    endpoint: String,
    tracker: LeaderTracker,
    handler: InboundSlot,
    connect_timeout: Duration,
    shutdown_tx: mpsc::Sender<()>,
}

impl TcpMessageBus {
    /// Bind the listener for `endpoint` and start serving inbound requests.
    ///
    /// A port of 0 picks a free port; the bus endpoint reflects it.
    pub async fn bind(endpoint: &str, connect_timeout: Duration) -> Result<Arc<Self>> {
        let authority = endpoint_authority(endpoint);
        let addr: SocketAddr = authority
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(authority.to_string()))?;

        let listener = TcpListener::bind(addr).await.map_err(NetworkError::Io)?;
        let local_addr = listener.local_addr().map_err(NetworkError::Io)?;

        let scheme = endpoint
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .unwrap_or(DEFAULT_SCHEME);
        let endpoint = format!("{scheme}://{local_addr}");

        let handler: InboundSlot = Arc::new(RwLock::new(None));
        let (server, shutdown_tx) = NetworkServer::new(listener, handler.clone());
        tokio::spawn(server.run());

        info!(endpoint = %endpoint, "Message bus bound");

        Ok(Arc::new(Self {
            tracker: LeaderTracker::new(endpoint.clone()),
            endpoint,
            handler,
            connect_timeout,
            shutdown_tx,
        }))
    }

    /// Handle used by the consensus collaborator to report leadership.
    pub fn leader_tracker(&self) -> LeaderTracker {
        self.tracker.clone()
    }

    /// Stop accepting inbound connections.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn request(&self, endpoint: &str, message: &Envelope) -> Result<Envelope> {
        let authority = endpoint_authority(endpoint).to_string();

        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&authority))
            .await
            .map_err(|_| NetworkError::Timeout {
                addr: authority.clone(),
                after: self.connect_timeout,
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: authority.clone(),
                reason: e.to_string(),
            })?;

        stream
            .write_all(&frame_message(message)?)
            .await
            .map_err(NetworkError::Io)?;

        match read_frame(&mut stream).await? {
            Some(reply) => Ok(reply),
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }
}

#[async_trait]
impl MessageBus for TcpMessageBus {
    fn local_endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn leader(&self) -> Option<Leader> {
        self.tracker.leader()
    }

    async fn send_to_leader(
        &self,
        message: Envelope,
        cancel: &CancellationToken,
    ) -> Result<Envelope> {
        let leader = self
            .tracker
            .leader()
            .ok_or_else(|| Error::Internal("no leader to send to".to_string()))?;

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            reply = self.request(&leader.endpoint, &message) => reply,
        }
    }

    fn add_listener(&self, handler: Arc<dyn InboundHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn remove_listener(&self) {
        *self.handler.write() = None;
    }
}

impl std::fmt::Debug for TcpMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMessageBus")
            .field("endpoint", &self.endpoint)
            .field("leader", &self.tracker.leader())
            .finish()
    }
}
