//! Rendezvous client
//!
//! Maps peer addresses to logical relay links and surfaces connect, message,
//! and close events without interpreting payloads. Tracks which addresses
//! are blocked from reconnecting after an intentional local teardown.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::protocol::{ClientFrame, NegotiationMessage, ServerFrame};
use super::RelayLink;
use crate::{Error, Result};

/// Events raised to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// A logical link to `peer` opened (either direction)
    Connected(String),
    /// A negotiation message arrived from `peer`
    Message(NegotiationMessage, String),
    /// The logical link to `peer` closed
    Closed(String),
}

/// Rendezvous client over a relay link
pub struct RendezvousClient<L: RelayLink> {
    link: Arc<L>,
    local_address: RwLock<Option<String>>,
    /// Peer addresses with an open logical link
    links: RwLock<HashSet<String>>,
    /// Addresses excluded from reconnection after intentional teardown
    blocked: RwLock<HashSet<String>>,
    events: mpsc::Sender<RelayEvent>,
    pending_listen: Mutex<Option<oneshot::Sender<Result<String>>>>,
}

impl<L: RelayLink> RendezvousClient<L> {
    /// Create a client over `link` and start its receive loop
    ///
    /// Events are delivered on the returned receiver until the link closes.
    pub fn start(link: L) -> (Arc<Self>, mpsc::Receiver<RelayEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let client = Arc::new(Self {
            link: Arc::new(link),
            local_address: RwLock::new(None),
            links: RwLock::new(HashSet::new()),
            blocked: RwLock::new(HashSet::new()),
            events: events_tx,
            pending_listen: Mutex::new(None),
        });

        let runner = Arc::clone(&client);
        tokio::spawn(async move {
            runner.run().await;
        });

        (client, events_rx)
    }

    async fn run(&self) {
        while let Some(frame) = self.link.recv().await {
            self.handle_frame(frame).await;
        }
        debug!("Relay link closed, rendezvous client stopping");

        // Everything that was linked is now unreachable
        let peers: Vec<String> = self.links.write().await.drain().collect();
        for peer in peers {
            let _ = self.events.send(RelayEvent::Closed(peer)).await;
        }
    }

    /// Claim an address on the relay
    ///
    /// Generates a six-digit address when none is supplied. Fails with
    /// [`Error::AddressTaken`] on collision; the caller retries with a
    /// different address. A second call supersedes any pending claim.
    pub async fn listen(&self, address: Option<String>) -> Result<String> {
        let address = address.unwrap_or_else(random_address);

        let (tx, rx) = oneshot::channel();
        if self.pending_listen.lock().await.replace(tx).is_some() {
            debug!("Superseding a pending listen");
        }

        self.link
            .send(ClientFrame::Listen {
                address: address.clone(),
            })
            .await?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::SignalingError(
                "Listen superseded or relay link lost".to_string(),
            )),
        }
    }

    /// Initiate a logical link to `peer`
    ///
    /// A manual attempt clears any block previously recorded for the
    /// address: a deliberate retry always overrides a prior intentional
    /// disconnect. A non-manual attempt towards a blocked address is not
    /// sent at all.
    pub async fn connect_to(&self, peer: &str, manual: bool) -> Result<()> {
        if manual {
            self.unblock(peer).await;
        } else if self.is_blocked(peer).await {
            warn!("Refusing to connect to blocked peer {}", peer);
            return Err(Error::SignalingError(format!(
                "Peer {} is blocked; reconnect manually to override",
                peer
            )));
        }

        self.link
            .send(ClientFrame::Connect {
                to: peer.to_string(),
                manual,
            })
            .await
    }

    /// Send a negotiation message to `peer`; silently dropped when no link
    /// is open (the orchestrator observes loss through its state machine,
    /// not through send failures)
    pub async fn send(&self, message: &NegotiationMessage, peer: &str) {
        if !self.links.read().await.contains(peer) {
            debug!("Dropping negotiation message for unlinked peer {}", peer);
            return;
        }
        let payload = match message.to_value() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode negotiation message: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .link
            .send(ClientFrame::Relay {
                to: peer.to_string(),
                payload,
            })
            .await
        {
            debug!("Relay send to {} failed: {}", peer, e);
        }
    }

    /// Tear down the logical link to `peer` without emitting a local event
    pub async fn close_link(&self, peer: &str) {
        if self.links.write().await.remove(peer) {
            let _ = self
                .link
                .send(ClientFrame::Close {
                    to: peer.to_string(),
                })
                .await;
        }
    }

    /// The address claimed by the last successful listen
    pub async fn local_address(&self) -> Option<String> {
        self.local_address.read().await.clone()
    }

    /// Exclude `peer` from automatic reconnection and inbound accepts
    pub async fn block(&self, peer: &str) {
        info!("Blocking peer {}", peer);
        self.blocked.write().await.insert(peer.to_string());
    }

    /// Clear the block for `peer`
    pub async fn unblock(&self, peer: &str) {
        if self.blocked.write().await.remove(peer) {
            info!("Unblocked peer {}", peer);
        }
    }

    /// Clear every recorded block (role reset)
    pub async fn clear_blocks(&self) {
        self.blocked.write().await.clear();
    }

    /// Close the underlying relay link; the receive loop then drains and
    /// emits `Closed` for every open link
    pub async fn shutdown(&self) {
        self.link.close().await;
    }

    /// Whether `peer` is currently blocked
    pub async fn is_blocked(&self, peer: &str) -> bool {
        self.blocked.read().await.contains(peer)
    }

    async fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::ListenOk { address } => {
                *self.local_address.write().await = Some(address.clone());
                if let Some(tx) = self.pending_listen.lock().await.take() {
                    let _ = tx.send(Ok(address));
                }
            }
            ServerFrame::AddressTaken { address } => {
                if let Some(tx) = self.pending_listen.lock().await.take() {
                    let _ = tx.send(Err(Error::AddressTaken(address)));
                }
            }
            ServerFrame::Incoming { from, manual } => {
                // Manual attempts override a prior block, symmetric to connect_to
                if manual {
                    self.unblock(&from).await;
                }
                if self.is_blocked(&from).await {
                    info!("Rejecting link from blocked peer {}", from);
                    let _ = self.link.send(ClientFrame::Reject { to: from }).await;
                    return;
                }
                let _ = self
                    .link
                    .send(ClientFrame::Accept { to: from.clone() })
                    .await;
                self.links.write().await.insert(from.clone());
                debug!("Link open with {}", from);
                let _ = self.events.send(RelayEvent::Connected(from)).await;
            }
            ServerFrame::Opened { peer } => {
                self.links.write().await.insert(peer.clone());
                debug!("Link open with {}", peer);
                let _ = self.events.send(RelayEvent::Connected(peer)).await;
            }
            ServerFrame::Message { from, payload } => match NegotiationMessage::from_value(payload)
            {
                Ok(message) => {
                    let _ = self.events.send(RelayEvent::Message(message, from)).await;
                }
                Err(e) => warn!("Dropping malformed negotiation message from {}: {}", from, e),
            },
            ServerFrame::Closed { peer } => {
                self.links.write().await.remove(&peer);
                let _ = self.events.send(RelayEvent::Closed(peer)).await;
            }
        }
    }
}

/// Six-digit relay address, the "join code" handed to the other side
fn random_address() -> String {
    rand::thread_rng().gen_range(100_000..1_000_000).to_string()
}
