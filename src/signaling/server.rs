//! WebSocket rendezvous relay server
//!
//! Accepts WebSocket connections and routes their frames through a shared
//! [`RelayCore`]. The relay is a single rendezvous service; it never
//! interprets negotiation payloads.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::relay::RelayCore;
use crate::Result;

/// WebSocket frontend for a rendezvous relay
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    core: Arc<RelayCore>,
}

impl RelayServer {
    /// Bind to `addr` (use port 0 for an ephemeral port in tests)
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Relay server listening on ws://{}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            core: RelayCore::new(),
        })
    }

    /// The bound socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A ws:// URL clients can connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Start accepting connections; returns a shutdown handle
    pub fn start(self) -> RelayServerHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let core = Arc::clone(&self.core);
        let listener = self.listener;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                debug!("Accepted relay connection from {}", peer_addr);
                                let core = Arc::clone(&core);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, core).await {
                                        warn!("Relay connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept relay connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Relay server shutting down");
                        break;
                    }
                }
            }
        });

        RelayServerHandle { shutdown_tx, task }
    }
}

/// Handle for stopping a running relay server
pub struct RelayServerHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl RelayServerHandle {
    /// Stop the accept loop and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

async fn handle_connection(stream: TcpStream, core: Arc<RelayCore>) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| crate::Error::SignalingError(format!("WebSocket handshake failed: {}", e)))?;
    let (mut sink, mut stream) = ws.split();

    let (conn, mut rx) = core.register().await;

    // Writer: pump routed frames out to this client
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to serialize relay frame: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    // Reader: route inbound frames until the client goes away
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                Ok(frame) => core.handle_frame(conn, frame).await,
                Err(e) => warn!("Dropping malformed client frame: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Relay client stream error: {}", e);
                break;
            }
        }
    }

    core.unregister(conn).await;
    writer.abort();
    Ok(())
}
