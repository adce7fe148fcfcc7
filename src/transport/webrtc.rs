//! WebRTC-backed negotiator
//!
//! One `RTCPeerConnection` plus one data channel per peer. Descriptions are
//! produced only after ICE gathering completes, so each one carries its
//! candidates and the whole negotiation is a single offer/answer exchange
//! with no trickle path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::negotiator::{Negotiator, SendTarget, TransportEvent, TransportState};
use crate::config::PeerLinkConfig;
use crate::identity::Identity;
use crate::signaling::{ChannelMessage, Description};
use crate::{Error, Result};

/// Label for the single data channel carrying all application traffic
const DATA_CHANNEL_LABEL: &str = "peerlink-data";

/// Event queue depth towards the orchestrator
const EVENT_QUEUE_DEPTH: usize = 64;

type ChannelSlot = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

/// One peer's live connection attempt
///
/// Callbacks capture the `discarded` flag and the channel slot, never the
/// entry itself, so tearing the entry down drops the peer connection.
struct Entry {
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
    /// Set when the attempt is superseded or torn down; callbacks from a
    /// discarded attempt emit nothing
    discarded: Arc<AtomicBool>,
}

impl Entry {
    fn discard(&self) {
        self.discarded.store(true, Ordering::SeqCst);
    }
}

/// WebRTC negotiator: production transport behind the [`Negotiator`] seam
pub struct WebRtcNegotiator {
    api: API,
    rtc_config: RTCConfiguration,
    identity: Identity,
    entries: RwLock<HashMap<String, Entry>>,
    events: mpsc::Sender<TransportEvent>,
}

impl WebRtcNegotiator {
    /// Build a negotiator from the engine configuration
    ///
    /// Transport events are delivered on the returned receiver. `identity`
    /// is sent to each peer as soon as its channel opens.
    pub fn new(
        config: &PeerLinkConfig,
        identity: Identity,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Ok((
            Self {
                api,
                rtc_config,
                identity,
                entries: RwLock::new(HashMap::new()),
                events: events_tx,
            },
            events_rx,
        ))
    }

    /// Start a fresh attempt for `peer`, superseding any existing one
    async fn begin_attempt(&self, peer: &str) -> Result<Arc<RTCPeerConnection>> {
        let old = self.entries.write().await.remove(peer);
        if let Some(old) = old {
            debug!("Superseding existing attempt for {}", peer);
            old.discard();
            let _ = old.pc.close().await;
        }

        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(|e| {
                    Error::WebRtcError(format!("Failed to create peer connection: {}", e))
                })?,
        );

        let entry = Entry {
            pc: Arc::clone(&pc),
            channel: Arc::new(RwLock::new(None)),
            discarded: Arc::new(AtomicBool::new(false)),
        };

        let events = self.events.clone();
        let peer_name = peer.to_string();
        let discarded = Arc::clone(&entry.discarded);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let events = events.clone();
            let peer = peer_name.clone();
            let discarded = Arc::clone(&discarded);

            Box::pin(async move {
                if discarded.load(Ordering::SeqCst) {
                    return;
                }
                let state = match s {
                    RTCPeerConnectionState::Connected => TransportState::Open,
                    RTCPeerConnectionState::Disconnected => TransportState::Degraded,
                    RTCPeerConnectionState::Failed => TransportState::Failed,
                    RTCPeerConnectionState::Closed => TransportState::Closed,
                    _ => return,
                };
                debug!("Peer {} connection state: {:?} -> {}", peer, s, state);
                let _ = events
                    .send(TransportEvent::StateChanged { peer, state })
                    .await;
            })
        }));

        self.entries.write().await.insert(peer.to_string(), entry);
        Ok(pc)
    }

    async fn entry_parts(&self, peer: &str) -> Option<(ChannelSlot, Arc<AtomicBool>)> {
        self.entries
            .read()
            .await
            .get(peer)
            .map(|e| (Arc::clone(&e.channel), Arc::clone(&e.discarded)))
    }

    /// Finish gathering and return the serialized local description
    async fn gathered_local_description(&self, pc: &RTCPeerConnection) -> Result<Description> {
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after gathering".to_string()))?;
        let blob = serde_json::to_string(&local).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize description: {}", e))
        })?;
        Ok(Description::new(blob))
    }
}

fn parse_description(description: &Description) -> Result<RTCSessionDescription> {
    serde_json::from_str(description.as_str())
        .map_err(|e| Error::SdpError(format!("Malformed remote description: {}", e)))
}

#[async_trait]
impl Negotiator for WebRtcNegotiator {
    async fn create_offer(&self, peer: &str) -> Result<Description> {
        let pc = self.begin_attempt(peer).await?;
        let (slot, discarded) = self.entry_parts(peer).await.ok_or_else(|| {
            Error::InvalidNegotiationState(format!("Attempt for {} vanished", peer))
        })?;

        // Initiator owns the channel; the responder receives it in the offer
        let channel = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to create channel: {}", e)))?;
        wire_channel(
            self.events.clone(),
            self.identity.clone(),
            peer.to_string(),
            discarded,
            slot,
            channel,
        )
        .await;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        // Block until gathering completes so the description carries its
        // candidates and no trickle exchange is needed
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;
        let _ = gathered.recv().await;

        self.gathered_local_description(&pc).await
    }

    async fn create_answer(&self, peer: &str, offer: Description) -> Result<Description> {
        let remote = parse_description(&offer)?;
        let pc = self.begin_attempt(peer).await?;
        let (slot, discarded) = self.entry_parts(peer).await.ok_or_else(|| {
            Error::InvalidNegotiationState(format!("Attempt for {} vanished", peer))
        })?;

        // Responder side: the channel arrives with the remote offer
        let events = self.events.clone();
        let identity = self.identity.clone();
        let peer_name = peer.to_string();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events = events.clone();
            let identity = identity.clone();
            let peer = peer_name.clone();
            let discarded = Arc::clone(&discarded);
            let slot = Arc::clone(&slot);

            Box::pin(async move {
                if discarded.load(Ordering::SeqCst) {
                    return;
                }
                debug!("Inbound data channel '{}' from {}", channel.label(), peer);
                wire_channel(events, identity, peer, discarded, slot, channel).await;
            })
        }));

        pc.set_remote_description(remote)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote offer: {}", e)))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;
        let _ = gathered.recv().await;

        self.gathered_local_description(&pc).await
    }

    async fn accept_answer(&self, peer: &str, answer: Description) -> Result<()> {
        let pc = self
            .entries
            .read()
            .await
            .get(peer)
            .map(|e| Arc::clone(&e.pc))
            .ok_or_else(|| {
                Error::InvalidNegotiationState(format!("No pending offer for peer {}", peer))
            })?;

        let remote = parse_description(&answer)?;
        pc.set_remote_description(remote)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote answer: {}", e)))
    }

    async fn send(&self, target: SendTarget, message: &ChannelMessage) -> Result<()> {
        let bytes = Bytes::from(message.to_bytes()?);

        match target {
            SendTarget::Peer(peer) => {
                let slot = self
                    .entries
                    .read()
                    .await
                    .get(&peer)
                    .map(|e| Arc::clone(&e.channel))
                    .ok_or_else(|| Error::NoSuchSession(peer.clone()))?;
                let channel = slot.read().await.clone().ok_or_else(|| {
                    Error::DataChannelError(format!("No open channel to {}", peer))
                })?;
                channel.send(&bytes).await.map_err(|e| {
                    Error::DataChannelError(format!("Send to {} failed: {}", peer, e))
                })?;
                Ok(())
            }
            SendTarget::Broadcast => {
                let slots: Vec<(String, ChannelSlot)> = self
                    .entries
                    .read()
                    .await
                    .iter()
                    .map(|(k, v)| (k.clone(), Arc::clone(&v.channel)))
                    .collect();
                for (peer, slot) in slots {
                    let channel = slot.read().await.clone();
                    if let Some(channel) = channel {
                        if let Err(e) = channel.send(&bytes).await {
                            debug!("Broadcast to {} skipped: {}", peer, e);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    async fn disconnect(&self, peer: &str) {
        let entry = self.entries.write().await.remove(peer);
        let Some(entry) = entry else {
            return;
        };
        info!("Tearing down transport for {}", peer);
        entry.discard();
        if let Err(e) = entry.pc.close().await {
            debug!("Error closing peer connection for {}: {}", peer, e);
        }
        let _ = self
            .events
            .send(TransportEvent::StateChanged {
                peer: peer.to_string(),
                state: TransportState::Closed,
            })
            .await;
    }
}

/// Attach open/message/close handlers to a data channel, either side
async fn wire_channel(
    events: mpsc::Sender<TransportEvent>,
    identity: Identity,
    peer: String,
    discarded: Arc<AtomicBool>,
    slot: ChannelSlot,
    channel: Arc<RTCDataChannel>,
) {
    *slot.write().await = Some(Arc::clone(&channel));

    let open_events = events.clone();
    let open_peer = peer.clone();
    let open_discarded = Arc::clone(&discarded);
    let open_channel = Arc::clone(&channel);
    channel.on_open(Box::new(move || {
        let events = open_events.clone();
        let peer = open_peer.clone();
        let discarded = Arc::clone(&open_discarded);
        let identity = identity.clone();
        let channel = Arc::clone(&open_channel);

        Box::pin(async move {
            if discarded.load(Ordering::SeqCst) {
                return;
            }
            info!("Data channel open with {}", peer);

            // Identity goes out first so the peer can label the session
            // before any application traffic arrives
            let hello = ChannelMessage::Identity {
                stable_id: identity.stable_id,
                display_name: identity.display_name,
            };
            match hello.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = channel.send(&Bytes::from(bytes)).await {
                        warn!("Failed to send identity to {}: {}", peer, e);
                    }
                }
                Err(e) => warn!("Failed to encode identity: {}", e),
            }

            let _ = events
                .send(TransportEvent::StateChanged {
                    peer,
                    state: TransportState::Open,
                })
                .await;
        })
    }));

    let msg_events = events.clone();
    let msg_peer = peer.clone();
    let msg_discarded = Arc::clone(&discarded);
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = msg_events.clone();
        let peer = msg_peer.clone();
        let discarded = Arc::clone(&msg_discarded);

        Box::pin(async move {
            if discarded.load(Ordering::SeqCst) {
                return;
            }
            match ChannelMessage::from_bytes(&msg.data) {
                Ok(message) => {
                    let _ = events.send(TransportEvent::Message { peer, message }).await;
                }
                Err(e) => warn!("Dropping malformed channel message from {}: {}", peer, e),
            }
        })
    }));

    let close_peer = peer.clone();
    channel.on_close(Box::new(move || {
        let events = events.clone();
        let peer = close_peer.clone();
        let discarded = Arc::clone(&discarded);

        Box::pin(async move {
            if discarded.load(Ordering::SeqCst) {
                return;
            }
            debug!("Data channel closed with {}", peer);
            let _ = events
                .send(TransportEvent::StateChanged {
                    peer,
                    state: TransportState::Closed,
                })
                .await;
        })
    }));

    channel.on_error(Box::new(move |e: webrtc::Error| {
        let peer = peer.clone();
        Box::pin(async move {
            warn!("Data channel error with {}: {}", peer, e);
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    fn local_only_config() -> PeerLinkConfig {
        // No STUN: host candidates only, so gathering finishes immediately
        PeerLinkConfig {
            stun_servers: vec![],
            ..Default::default()
        }
    }

    fn test_identity(name: &str) -> Identity {
        Identity {
            stable_id: format!("id-{}", name),
            display_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_offer_is_self_contained() {
        let (negotiator, _events) =
            WebRtcNegotiator::new(&local_only_config(), test_identity("a")).unwrap();

        let offer = negotiator.create_offer("peer").await.unwrap();
        let parsed: RTCSessionDescription = serde_json::from_str(offer.as_str()).unwrap();
        assert_eq!(parsed.sdp_type, RTCSdpType::Offer);
        // Gathering already finished; the description carries the data
        // channel m-line and whatever candidates this host produced
        assert!(parsed.sdp.contains("application"));
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let (initiator, _ie) =
            WebRtcNegotiator::new(&local_only_config(), test_identity("a")).unwrap();
        let (responder, _re) =
            WebRtcNegotiator::new(&local_only_config(), test_identity("b")).unwrap();

        let offer = initiator.create_offer("b").await.unwrap();
        let answer = responder.create_answer("a", offer).await.unwrap();

        let parsed: RTCSessionDescription = serde_json::from_str(answer.as_str()).unwrap();
        assert_eq!(parsed.sdp_type, RTCSdpType::Answer);

        initiator.accept_answer("b", answer).await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_answer_without_offer_is_protocol_error() {
        let (negotiator, _events) =
            WebRtcNegotiator::new(&local_only_config(), test_identity("a")).unwrap();

        let err = negotiator
            .accept_answer("nobody", Description::new("{}"))
            .await
            .unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_malformed_remote_description_rejected() {
        let (negotiator, _events) =
            WebRtcNegotiator::new(&local_only_config(), test_identity("a")).unwrap();

        let err = negotiator
            .create_answer("peer", Description::new("not json"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SdpError(_)));
    }

    #[tokio::test]
    async fn test_send_without_channel_fails() {
        let (negotiator, _events) =
            WebRtcNegotiator::new(&local_only_config(), test_identity("a")).unwrap();

        let err = negotiator
            .send(
                SendTarget::Peer("nobody".to_string()),
                &ChannelMessage::DisconnectIntent,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchSession(_)));
    }

    #[tokio::test]
    async fn test_disconnect_emits_closed_once_and_is_idempotent() {
        let (negotiator, mut events) =
            WebRtcNegotiator::new(&local_only_config(), test_identity("a")).unwrap();

        negotiator.create_offer("peer").await.unwrap();
        negotiator.disconnect("peer").await;

        // The locally synthesized Closed arrives; discarded-attempt events do not
        let mut saw_closed = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(200), events.recv()).await
        {
            if let TransportEvent::StateChanged {
                state: TransportState::Closed,
                ..
            } = event
            {
                saw_closed = true;
                break;
            }
        }
        assert!(saw_closed);

        negotiator.disconnect("peer").await;
    }
}
