//! TCP server for relayed change requests.

use crate::cluster::bus::InboundHandler;
use crate::error::{NetworkError, Result};
use crate::network::rpc::{decode_message, frame_message, Envelope, ERROR_RESPONSE, MAX_FRAME_LEN};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Handler currently registered for inbound requests, if any.
pub type InboundSlot = Arc<RwLock<Option<Arc<dyn InboundHandler>>>>;

/// TCP server delivering framed envelopes to the registered handler.
pub struct NetworkServer {
    listener: TcpListener,

    /// Message handler.
    handler: InboundSlot,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Create a server over an already bound listener.
    pub fn new(listener: TcpListener, handler: InboundSlot) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            handler,
            shutdown_rx,
        };

        (server, shutdown_tx)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Run the server until shutdown is signalled.
    pub async fn run(mut self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Network server listening");
        }

        // Cancels in-flight requests when the server stops
        let stopping = CancellationToken::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let cancel = stopping.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, cancel).await {
                                    debug!(error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Network server shutting down");
                    stopping.cancel();
                    break;
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: InboundSlot,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let Some(message) = read_frame(&mut stream).await? else {
                // Connection closed
                return Ok(());
            };

            let current = handler.read().clone();
            let reply = match current {
                Some(handler) => handler.receive(message, &cancel).await,
                None => Envelope::text(ERROR_RESPONSE, "node is not accepting requests"),
            };

            let framed = frame_message(&reply)?;
            stream.write_all(&framed).await.map_err(NetworkError::Io)?;
        }
    }
}

/// Read one length-prefixed envelope. `None` means the peer closed cleanly.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<Envelope>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::ReceiveFailed("message too large".to_string()).into());
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await.map_err(NetworkError::Io)?;

    Ok(Some(decode_message(&data)?))
}
