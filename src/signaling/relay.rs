//! Relay routing core and in-memory relay
//!
//! [`RelayCore`] is the address table and frame router shared by the
//! WebSocket relay server and the in-memory relay used in tests. It binds
//! addresses to connections, routes link setup and opaque payloads between
//! them, and synthesizes `Closed` frames when a connection vanishes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use super::protocol::{ClientFrame, ServerFrame};
use super::RelayLink;
use crate::Result;

/// Identifier for one relay connection
pub type ConnId = u64;

/// Queue depth for frames pending delivery to one client
const FRAME_QUEUE_DEPTH: usize = 64;

#[derive(Debug)]
struct ConnEntry {
    tx: mpsc::Sender<ServerFrame>,
    address: Option<String>,
    /// Peer addresses this connection has an open logical link with
    links: HashSet<String>,
}

#[derive(Debug, Default)]
struct CoreState {
    next_conn: ConnId,
    conns: HashMap<ConnId, ConnEntry>,
    addresses: HashMap<String, ConnId>,
}

/// Address table and frame router for a rendezvous relay
#[derive(Debug, Default)]
pub struct RelayCore {
    state: RwLock<CoreState>,
}

impl RelayCore {
    /// Create an empty routing core
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection; frames for it are delivered on the returned receiver
    pub async fn register(&self) -> (ConnId, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let mut state = self.state.write().await;
        let conn = state.next_conn;
        state.next_conn += 1;
        state.conns.insert(
            conn,
            ConnEntry {
                tx,
                address: None,
                links: HashSet::new(),
            },
        );
        (conn, rx)
    }

    /// Drop a connection: free its address and close its links
    pub async fn unregister(&self, conn: ConnId) {
        let mut state = self.state.write().await;
        let Some(entry) = state.conns.remove(&conn) else {
            return;
        };

        let Some(address) = entry.address else {
            return;
        };
        state.addresses.remove(&address);
        debug!("Relay address {} released", address);

        // Notify every linked peer that this address is gone
        for peer in entry.links {
            if let Some(peer_conn) = state.addresses.get(&peer).copied() {
                if let Some(peer_entry) = state.conns.get_mut(&peer_conn) {
                    peer_entry.links.remove(&address);
                    let _ = peer_entry.tx.try_send(ServerFrame::Closed {
                        peer: address.clone(),
                    });
                }
            }
        }
    }

    /// Route one client frame
    pub async fn handle_frame(&self, conn: ConnId, frame: ClientFrame) {
        match frame {
            ClientFrame::Listen { address } => self.handle_listen(conn, address).await,
            ClientFrame::Connect { to, manual } => {
                self.forward_or_close(conn, &to, |from| ServerFrame::Incoming { from, manual })
                    .await
            }
            ClientFrame::Accept { to } => self.handle_accept(conn, to).await,
            ClientFrame::Reject { to } => {
                self.forward_or_drop(conn, &to, |from| ServerFrame::Closed { peer: from })
                    .await
            }
            ClientFrame::Relay { to, payload } => {
                self.forward_or_drop(conn, &to, |from| ServerFrame::Message { from, payload })
                    .await
            }
            ClientFrame::Close { to } => self.handle_close(conn, to).await,
        }
    }

    async fn handle_listen(&self, conn: ConnId, address: String) {
        let mut state = self.state.write().await;
        if state.addresses.contains_key(&address) {
            if let Some(entry) = state.conns.get(&conn) {
                let _ = entry.tx.send(ServerFrame::AddressTaken { address }).await;
            }
            return;
        }

        // A re-listen on the same connection releases the old address
        if let Some(entry) = state.conns.get(&conn) {
            if let Some(old) = entry.address.clone() {
                state.addresses.remove(&old);
            }
        }

        state.addresses.insert(address.clone(), conn);
        if let Some(entry) = state.conns.get_mut(&conn) {
            entry.address = Some(address.clone());
            debug!("Relay address {} claimed", address);
            let _ = entry.tx.send(ServerFrame::ListenOk { address }).await;
        }
    }

    async fn handle_accept(&self, conn: ConnId, to: String) {
        let mut state = self.state.write().await;
        let Some(from) = state.conns.get(&conn).and_then(|e| e.address.clone()) else {
            warn!("Accept from connection with no bound address");
            return;
        };

        let Some(target_conn) = state.addresses.get(&to).copied() else {
            // Initiator vanished before the accept arrived
            if let Some(entry) = state.conns.get(&conn) {
                let _ = entry.tx.send(ServerFrame::Closed { peer: to }).await;
            }
            return;
        };

        // Record the link on both ends so either side's disappearance
        // produces a Closed frame for the other
        if let Some(entry) = state.conns.get_mut(&conn) {
            entry.links.insert(to.clone());
        }
        if let Some(entry) = state.conns.get_mut(&target_conn) {
            entry.links.insert(from.clone());
            let _ = entry.tx.send(ServerFrame::Opened { peer: from }).await;
        }
    }

    async fn handle_close(&self, conn: ConnId, to: String) {
        let mut state = self.state.write().await;
        let Some(from) = state.conns.get(&conn).and_then(|e| e.address.clone()) else {
            return;
        };
        if let Some(entry) = state.conns.get_mut(&conn) {
            entry.links.remove(&to);
        }
        if let Some(target_conn) = state.addresses.get(&to).copied() {
            if let Some(entry) = state.conns.get_mut(&target_conn) {
                entry.links.remove(&from);
                let _ = entry.tx.send(ServerFrame::Closed { peer: from }).await;
            }
        }
    }

    /// Forward a frame to `to`; send `Closed` back when the target is absent
    async fn forward_or_close<F>(&self, conn: ConnId, to: &str, build: F)
    where
        F: FnOnce(String) -> ServerFrame,
    {
        let state = self.state.read().await;
        let Some(from) = state.conns.get(&conn).and_then(|e| e.address.clone()) else {
            warn!("Frame from connection with no bound address");
            return;
        };
        match state.addresses.get(to).copied() {
            Some(target_conn) => {
                if let Some(entry) = state.conns.get(&target_conn) {
                    let _ = entry.tx.send(build(from)).await;
                }
            }
            None => {
                debug!("Target address {} unreachable", to);
                if let Some(entry) = state.conns.get(&conn) {
                    let _ = entry
                        .tx
                        .send(ServerFrame::Closed {
                            peer: to.to_string(),
                        })
                        .await;
                }
            }
        }
    }

    /// Forward a frame to `to`; drop silently when the target is absent
    async fn forward_or_drop<F>(&self, conn: ConnId, to: &str, build: F)
    where
        F: FnOnce(String) -> ServerFrame,
    {
        let state = self.state.read().await;
        let Some(from) = state.conns.get(&conn).and_then(|e| e.address.clone()) else {
            return;
        };
        if let Some(target_conn) = state.addresses.get(to).copied() {
            if let Some(entry) = state.conns.get(&target_conn) {
                let _ = entry.tx.send(build(from)).await;
            }
        } else {
            debug!("Dropping frame for unreachable address {}", to);
        }
    }
}

/// In-process relay for tests and simulation
///
/// Routes frames through a shared [`RelayCore`] without any sockets.
#[derive(Debug, Default)]
pub struct MemoryRelay {
    core: Arc<RelayCore>,
}

impl MemoryRelay {
    /// Create a fresh relay
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: RelayCore::new(),
        })
    }

    /// Open a client link to this relay
    pub async fn connect(&self) -> MemoryLink {
        let (conn, rx) = self.core.register().await;
        MemoryLink {
            core: Arc::clone(&self.core),
            conn,
            rx: Mutex::new(rx),
        }
    }

    /// The routing core (shared with any server frontends)
    pub fn core(&self) -> &Arc<RelayCore> {
        &self.core
    }
}

/// In-memory relay link backed by channels
#[derive(Debug)]
pub struct MemoryLink {
    core: Arc<RelayCore>,
    conn: ConnId,
    rx: Mutex<mpsc::Receiver<ServerFrame>>,
}

#[async_trait::async_trait]
impl RelayLink for MemoryLink {
    async fn send(&self, frame: ClientFrame) -> Result<()> {
        self.core.handle_frame(self.conn, frame).await;
        Ok(())
    }

    async fn recv(&self) -> Option<ServerFrame> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.core.unregister(self.conn).await;
    }
}
