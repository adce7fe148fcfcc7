//! In-process mock transport
//!
//! A [`MockNetwork`] pairs negotiators by name and delivers channel messages
//! between them without any sockets or SDP. Descriptions are tiny JSON tags
//! that carry just enough to pair an answer with its offer. Tests drive
//! degradation, recovery, and link loss directly through the network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::negotiator::{Negotiator, SendTarget, TransportEvent, TransportState};
use crate::identity::Identity;
use crate::signaling::{ChannelMessage, Description};
use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct MockDescription {
    from: String,
    tag: String,
}

struct Endpoint {
    events: mpsc::Sender<TransportEvent>,
    identity: Identity,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<String, Endpoint>,
    /// Open duplex links, stored in both orders
    links: HashSet<(String, String)>,
}

/// Shared fabric connecting mock negotiators by name
#[derive(Default)]
pub struct MockNetwork {
    state: Mutex<NetworkState>,
}

impl MockNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a negotiator under `name`
    pub async fn attach(
        self: &Arc<Self>,
        name: &str,
        identity: Identity,
    ) -> (MockNegotiator, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        self.state.lock().await.endpoints.insert(
            name.to_string(),
            Endpoint {
                events: events_tx,
                identity,
            },
        );
        (
            MockNegotiator {
                name: name.to_string(),
                network: Arc::clone(self),
                pending_offers: Mutex::new(HashSet::new()),
                fail_next_offer: AtomicBool::new(false),
            },
            events_rx,
        )
    }

    /// Whether a link between `a` and `b` is open
    pub async fn linked(&self, a: &str, b: &str) -> bool {
        self.state
            .lock()
            .await
            .links
            .contains(&(a.to_string(), b.to_string()))
    }

    /// Degrade the link: both sides observe `Degraded`
    pub async fn degrade(&self, a: &str, b: &str) {
        let state = self.state.lock().await;
        for (side, other) in [(a, b), (b, a)] {
            if let Some(endpoint) = state.endpoints.get(side) {
                let _ = endpoint
                    .events
                    .send(TransportEvent::StateChanged {
                        peer: other.to_string(),
                        state: TransportState::Degraded,
                    })
                    .await;
            }
        }
    }

    /// Recover a degraded link: both sides observe `Open` again
    pub async fn restore(&self, a: &str, b: &str) {
        let state = self.state.lock().await;
        for (side, other) in [(a, b), (b, a)] {
            if let Some(endpoint) = state.endpoints.get(side) {
                let _ = endpoint
                    .events
                    .send(TransportEvent::StateChanged {
                        peer: other.to_string(),
                        state: TransportState::Open,
                    })
                    .await;
            }
        }
    }

    /// Sever the link without intent: both sides observe `Closed`
    pub async fn drop_link(&self, a: &str, b: &str) {
        let mut state = self.state.lock().await;
        state.links.remove(&(a.to_string(), b.to_string()));
        state.links.remove(&(b.to_string(), a.to_string()));
        for (side, other) in [(a, b), (b, a)] {
            if let Some(endpoint) = state.endpoints.get(side) {
                let _ = endpoint
                    .events
                    .send(TransportEvent::StateChanged {
                        peer: other.to_string(),
                        state: TransportState::Closed,
                    })
                    .await;
            }
        }
    }

    /// Open the link `a` <-> `b`: each side observes `Open`, then receives
    /// the other side's identity message, matching the real channel-open
    /// handshake order
    async fn open_link(&self, a: &str, b: &str) {
        let mut state = self.state.lock().await;
        state.links.insert((a.to_string(), b.to_string()));
        state.links.insert((b.to_string(), a.to_string()));

        for (side, other) in [(a, b), (b, a)] {
            let Some(other_identity) = state.endpoints.get(other).map(|e| e.identity.clone())
            else {
                continue;
            };
            if let Some(endpoint) = state.endpoints.get(side) {
                let _ = endpoint
                    .events
                    .send(TransportEvent::StateChanged {
                        peer: other.to_string(),
                        state: TransportState::Open,
                    })
                    .await;
                let _ = endpoint
                    .events
                    .send(TransportEvent::Message {
                        peer: other.to_string(),
                        message: ChannelMessage::Identity {
                            stable_id: other_identity.stable_id,
                            display_name: other_identity.display_name,
                        },
                    })
                    .await;
            }
        }
    }

    async fn deliver(&self, from: &str, to: &str, message: ChannelMessage) -> Result<()> {
        let state = self.state.lock().await;
        if !state.links.contains(&(from.to_string(), to.to_string())) {
            return Err(Error::DataChannelError(format!(
                "No open channel between {} and {}",
                from, to
            )));
        }
        if let Some(endpoint) = state.endpoints.get(to) {
            let _ = endpoint
                .events
                .send(TransportEvent::Message {
                    peer: from.to_string(),
                    message,
                })
                .await;
        }
        Ok(())
    }
}

/// Scripted negotiator backed by a [`MockNetwork`]
pub struct MockNegotiator {
    name: String,
    network: Arc<MockNetwork>,
    /// Peers we have produced an offer for and not yet answered
    pending_offers: Mutex<HashSet<String>>,
    fail_next_offer: AtomicBool,
}

impl MockNegotiator {
    /// Make the next `create_offer` call fail
    pub fn inject_offer_failure(&self) {
        self.fail_next_offer.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Negotiator for MockNegotiator {
    async fn create_offer(&self, peer: &str) -> Result<Description> {
        if self.fail_next_offer.swap(false, Ordering::SeqCst) {
            return Err(Error::WebRtcError("Injected offer failure".to_string()));
        }
        self.pending_offers.lock().await.insert(peer.to_string());
        let blob = serde_json::to_string(&MockDescription {
            from: self.name.clone(),
            tag: "offer".to_string(),
        })
        .map_err(|e| Error::SerializationError(e.to_string()))?;
        Ok(Description::new(blob))
    }

    async fn create_answer(&self, peer: &str, offer: Description) -> Result<Description> {
        let parsed: MockDescription = serde_json::from_str(offer.as_str())
            .map_err(|e| Error::SdpError(format!("Malformed offer: {}", e)))?;
        if parsed.tag != "offer" || parsed.from != peer {
            return Err(Error::SdpError(format!(
                "Offer does not match peer {}: {:?}",
                peer, parsed
            )));
        }
        let blob = serde_json::to_string(&MockDescription {
            from: self.name.clone(),
            tag: "answer".to_string(),
        })
        .map_err(|e| Error::SerializationError(e.to_string()))?;
        Ok(Description::new(blob))
    }

    async fn accept_answer(&self, peer: &str, answer: Description) -> Result<()> {
        if !self.pending_offers.lock().await.remove(peer) {
            return Err(Error::InvalidNegotiationState(format!(
                "No pending offer for peer {}",
                peer
            )));
        }
        let parsed: MockDescription = serde_json::from_str(answer.as_str())
            .map_err(|e| Error::SdpError(format!("Malformed answer: {}", e)))?;
        if parsed.tag != "answer" || parsed.from != peer {
            return Err(Error::SdpError(format!(
                "Answer does not match peer {}: {:?}",
                peer, parsed
            )));
        }
        self.network.open_link(&self.name, peer).await;
        Ok(())
    }

    async fn send(&self, target: SendTarget, message: &ChannelMessage) -> Result<()> {
        match target {
            SendTarget::Peer(peer) => self.network.deliver(&self.name, &peer, message.clone()).await,
            SendTarget::Broadcast => {
                let peers: Vec<String> = {
                    let state = self.network.state.lock().await;
                    state
                        .links
                        .iter()
                        .filter(|(from, _)| from == &self.name)
                        .map(|(_, to)| to.clone())
                        .collect()
                };
                for peer in peers {
                    if let Err(e) = self.network.deliver(&self.name, &peer, message.clone()).await {
                        debug!("Broadcast to {} skipped: {}", peer, e);
                    }
                }
                Ok(())
            }
        }
    }

    async fn disconnect(&self, peer: &str) {
        self.pending_offers.lock().await.remove(peer);

        let mut state = self.network.state.lock().await;
        let had_link = state.links.remove(&(self.name.clone(), peer.to_string()));
        state.links.remove(&(peer.to_string(), self.name.clone()));

        if let Some(endpoint) = state.endpoints.get(&self.name) {
            let _ = endpoint
                .events
                .send(TransportEvent::StateChanged {
                    peer: peer.to_string(),
                    state: TransportState::Closed,
                })
                .await;
        }
        if had_link {
            if let Some(endpoint) = state.endpoints.get(peer) {
                let _ = endpoint
                    .events
                    .send(TransportEvent::StateChanged {
                        peer: self.name.clone(),
                        state: TransportState::Closed,
                    })
                    .await;
            }
        }
    }
}
