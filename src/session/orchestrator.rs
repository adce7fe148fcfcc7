//! Session orchestrator
//!
//! Single event loop multiplexing application commands, rendezvous events,
//! and transport events over every peer session. All session state lives on
//! the loop and each event is handled to completion, so there is no locking
//! and no interleaving within a handler.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::table::SessionTable;
use crate::config::PeerLinkConfig;
use crate::directory::PeerDirectory;
use crate::identity::Identity;
use crate::signaling::{
    ChannelMessage, NegotiationMessage, RelayEvent, RelayLink, RendezvousClient,
};
use crate::transport::{Negotiator, SendTarget, TransportEvent, TransportState};
use crate::{Error, Result};

/// Attempts to claim an auto-generated address before giving up
const ADDRESS_CLAIM_ATTEMPTS: u32 = 3;

/// Notifications surfaced to the application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A session's transport state changed
    StateChanged {
        /// Peer address
        peer: String,
        /// The state just entered
        state: TransportState,
    },
    /// The peer announced its identity over the direct channel
    PeerIdentified {
        /// Peer address
        peer: String,
        /// Announced identity
        identity: Identity,
    },
    /// Application payload received from a peer
    Payload {
        /// Peer address
        peer: String,
        /// Decoded payload bytes
        data: Vec<u8>,
    },
    /// Automatic reconnection gave up; manual action required.
    /// Emitted at most once per failed session.
    ReconnectExhausted {
        /// Peer address
        peer: String,
    },
}

enum Command {
    Host {
        address: Option<String>,
        reply: oneshot::Sender<Result<String>>,
    },
    Join {
        address: String,
        manual: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        peer: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        target: SendTarget,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<(String, TransportState)>>,
    },
    Retry {
        peer: String,
        attempt: u32,
    },
    Shutdown,
}

/// Handle to a running session engine
///
/// Cheap to clone; every method sends a command to the event loop and
/// awaits its reply.
#[derive(Clone)]
pub struct SessionOrchestrator {
    cmd_tx: mpsc::Sender<Command>,
}

impl SessionOrchestrator {
    /// Start the engine over an established rendezvous client and negotiator
    ///
    /// Application-facing events are delivered on the returned receiver.
    pub fn start<L, N>(
        config: PeerLinkConfig,
        rendezvous: Arc<RendezvousClient<L>>,
        relay_events: mpsc::Receiver<RelayEvent>,
        negotiator: Arc<N>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> (Self, mpsc::Receiver<SessionEvent>)
    where
        L: RelayLink,
        N: Negotiator,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(64);

        let runner = Runner {
            sessions: SessionTable::new(config.max_peers as usize),
            config,
            rendezvous,
            negotiator,
            directory: PeerDirectory::new(),
            events: event_tx,
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(runner.run(cmd_rx, relay_events, transport_events));

        (Self { cmd_tx }, event_rx)
    }

    /// Claim a relay address and wait for new peers
    ///
    /// With `address: None` a six-digit address is generated; collisions
    /// are retried a few times before the error surfaces.
    pub async fn host(&self, address: Option<String>) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Host { address, reply }, rx).await
    }

    /// Connect to a hosting peer at `address`
    ///
    /// `manual` marks an explicit user action, which overrides any block
    /// recorded for the address on either side.
    pub async fn join(&self, address: &str, manual: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            Command::Join {
                address: address.to_string(),
                manual,
                reply,
            },
            rx,
        )
        .await
    }

    /// Deliberately disconnect from `peer` and block it from reconnecting
    pub async fn disconnect(&self, peer: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            Command::Disconnect {
                peer: peer.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Send an application payload to one peer
    pub async fn send_to(&self, peer: &str, data: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            Command::Send {
                target: SendTarget::Peer(peer.to_string()),
                data,
                reply,
            },
            rx,
        )
        .await
    }

    /// Send an application payload to every open peer, best effort
    pub async fn broadcast(&self, data: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            Command::Send {
                target: SendTarget::Broadcast,
                data,
                reply,
            },
            rx,
        )
        .await
    }

    /// Snapshot of live sessions and their states
    pub async fn sessions(&self) -> Result<Vec<(String, TransportState)>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Sessions { reply })
            .await
            .map_err(|_| engine_stopped())?;
        rx.await.map_err(|_| engine_stopped())
    }

    /// Stop the engine: tear down every session and the relay link
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    async fn send_command<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| engine_stopped())?;
        rx.await.map_err(|_| engine_stopped())?
    }
}

fn engine_stopped() -> Error {
    Error::SignalingError("Session engine stopped".to_string())
}

struct Runner<L: RelayLink, N: Negotiator> {
    config: PeerLinkConfig,
    rendezvous: Arc<RendezvousClient<L>>,
    negotiator: Arc<N>,
    sessions: SessionTable,
    directory: PeerDirectory,
    events: mpsc::Sender<SessionEvent>,
    cmd_tx: mpsc::Sender<Command>,
}

impl<L: RelayLink, N: Negotiator> Runner<L, N> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut relay_events: mpsc::Receiver<RelayEvent>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                Some(event) = relay_events.recv() => {
                    self.handle_relay_event(event).await;
                }
                Some(event) = transport_events.recv() => {
                    self.handle_transport_event(event).await;
                }
                else => break,
            }
        }

        for peer in self.sessions.peers() {
            self.negotiator.disconnect(&peer).await;
        }
        self.rendezvous.shutdown().await;
        debug!("Session engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Host { address, reply } => {
                let _ = reply.send(self.handle_host(address).await);
            }
            Command::Join {
                address,
                manual,
                reply,
            } => {
                let _ = reply.send(self.handle_join(&address, manual).await);
            }
            Command::Disconnect { peer, reply } => {
                let _ = reply.send(self.handle_disconnect(&peer).await);
            }
            Command::Send {
                target,
                data,
                reply,
            } => {
                // Payloads are datagrams: a peer without an open channel
                // just doesn't get this one. Only encoding failures surface.
                let result = match self
                    .negotiator
                    .send(target, &ChannelMessage::Payload { data })
                    .await
                {
                    Err(e @ Error::SerializationError(_)) => Err(e),
                    Err(e) => {
                        debug!("Payload dropped: {}", e);
                        Ok(())
                    }
                    Ok(()) => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::Sessions { reply } => {
                let _ = reply.send(self.sessions.states());
            }
            Command::Retry { peer, attempt } => {
                self.handle_retry(&peer, attempt).await;
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_host(&mut self, address: Option<String>) -> Result<String> {
        // A fresh hosting role starts with a clean slate
        self.rendezvous.clear_blocks().await;

        let address = self.claim_address(address).await?;
        info!("Hosting at relay address {}", address);
        Ok(address)
    }

    async fn handle_join(&mut self, address: &str, manual: bool) -> Result<()> {
        if let Some(session) = self.sessions.get(address) {
            if session.state == TransportState::Open {
                return Ok(());
            }
        }

        // A joiner needs its own address before the relay will route for it
        if self.rendezvous.local_address().await.is_none() {
            self.claim_address(None).await?;
        }

        let session = self.sessions.create(address, true)?;
        session.reconnect_attempts = 0;
        session.deliberate_close = false;
        session.retry_pending = false;
        session.reset_for_attempt();

        if let Err(e) = self.rendezvous.connect_to(address, manual).await {
            self.sessions.remove(address);
            return Err(e);
        }
        info!("Joining {} (manual: {})", address, manual);
        Ok(())
    }

    async fn handle_disconnect(&mut self, peer: &str) -> Result<()> {
        // Idempotent: disconnecting a peer with no session is a no-op
        let Some(session) = self.sessions.get_mut(peer) else {
            debug!("Disconnect from {} with no session", peer);
            return Ok(());
        };
        info!("Deliberate disconnect from {}", peer);
        session.deliberate_close = true;

        // Block first, then the courtesy notice, then tear down. The notice
        // is best effort; a dead channel just means the peer finds out from
        // its own transport.
        self.rendezvous.block(peer).await;
        if let Err(e) = self
            .negotiator
            .send(
                SendTarget::Peer(peer.to_string()),
                &ChannelMessage::DisconnectIntent,
            )
            .await
        {
            debug!("Disconnect notice to {} not delivered: {}", peer, e);
        }
        self.negotiator.disconnect(peer).await;
        self.rendezvous.close_link(peer).await;
        Ok(())
    }

    async fn handle_retry(&mut self, peer: &str, attempt: u32) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        session.retry_pending = false;
        if session.reconnect_attempts != attempt
            || session.deliberate_close
            || session.state == TransportState::Open
        {
            debug!("Dropping stale retry for {}", peer);
            return;
        }

        info!(
            "Reconnect attempt {}/{} towards {}",
            attempt, self.config.max_reconnect_attempts, peer
        );
        session.reset_for_attempt();
        if let Err(e) = self.rendezvous.connect_to(peer, false).await {
            // The retry chain is dead; surface the same terminal event as
            // running out of attempts
            warn!("Retry towards {} refused: {}", peer, e);
            self.sessions.remove(peer);
            self.emit(SessionEvent::ReconnectExhausted {
                peer: peer.to_string(),
            })
            .await;
        }
    }

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected(peer) => self.handle_link_connected(peer).await,
            RelayEvent::Message(message, peer) => {
                self.handle_negotiation_message(message, &peer).await
            }
            RelayEvent::Closed(peer) => self.handle_link_closed(&peer).await,
        }
    }

    async fn handle_link_connected(&mut self, peer: String) {
        if !self.sessions.contains(&peer) && !self.sessions.has_capacity() {
            warn!("Rejecting {}: session limit reached", peer);
            self.rendezvous.close_link(&peer).await;
            return;
        }
        let session = match self.sessions.create(&peer, false) {
            Ok(session) => session,
            Err(e) => {
                warn!("Cannot admit {}: {}", peer, e);
                return;
            }
        };

        if !session.apply_state(TransportState::Negotiating) {
            debug!(
                "Ignoring link to {} in state {}",
                peer, session.state
            );
            return;
        }
        let initiator = session.initiator;
        self.emit(SessionEvent::StateChanged {
            peer: peer.clone(),
            state: TransportState::Negotiating,
        })
        .await;

        // The accepting side makes the offer; the dialer answers. Retrying
        // on loss stays with the dialer, which redials the rendezvous link.
        if !initiator {
            match self.negotiator.create_offer(&peer).await {
                Ok(offer) => {
                    self.rendezvous
                        .send(&NegotiationMessage::Offer { body: offer }, &peer)
                        .await;
                }
                Err(e) => {
                    warn!("Offer towards {} failed: {}", peer, e);
                    self.negotiation_failed(&peer).await;
                }
            }
        }
    }

    async fn handle_negotiation_message(&mut self, message: NegotiationMessage, peer: &str) {
        let Some(session) = self.sessions.get(peer) else {
            debug!("Negotiation message from unknown peer {}", peer);
            return;
        };

        match message {
            NegotiationMessage::Offer { body } => {
                if !session.initiator {
                    warn!("Unexpected offer from {} on an accepted session", peer);
                    return;
                }
                match self.negotiator.create_answer(peer, body).await {
                    Ok(answer) => {
                        self.rendezvous
                            .send(&NegotiationMessage::Answer { body: answer }, peer)
                            .await;
                    }
                    Err(e) => {
                        warn!("Answer towards {} failed: {}", peer, e);
                        self.negotiation_failed(peer).await;
                    }
                }
            }
            NegotiationMessage::Answer { body } => {
                if session.initiator {
                    warn!("Unexpected answer from {} on a dialed session", peer);
                    return;
                }
                if let Err(e) = self.negotiator.accept_answer(peer, body).await {
                    warn!("Answer from {} rejected: {}", peer, e);
                    self.negotiation_failed(peer).await;
                }
            }
        }
    }

    async fn handle_link_closed(&mut self, peer: &str) {
        let Some(session) = self.sessions.get(peer) else {
            return;
        };
        // Once the direct channel is open the relay link is expendable
        if session.state == TransportState::Open || session.retry_pending {
            return;
        }
        debug!("Rendezvous link to {} closed before transport opened", peer);
        self.negotiation_failed(peer).await;
    }

    /// A negotiation attempt died: mark the session failed and decide
    /// whether to retry
    async fn negotiation_failed(&mut self, peer: &str) {
        if let Some(session) = self.sessions.get_mut(peer) {
            if session.apply_state(TransportState::Failed) {
                self.emit(SessionEvent::StateChanged {
                    peer: peer.to_string(),
                    state: TransportState::Failed,
                })
                .await;
            }
        }
        self.maybe_reconnect(peer).await;
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged { peer, state } => {
                self.handle_transport_state(&peer, state).await;
            }
            TransportEvent::Message { peer, message } => {
                self.handle_channel_message(&peer, message).await;
            }
        }
    }

    async fn handle_transport_state(&mut self, peer: &str, state: TransportState) {
        let Some(session) = self.sessions.get_mut(peer) else {
            debug!("Transport event for unknown peer {}", peer);
            return;
        };
        if !session.apply_state(state) {
            debug!(
                "Ignoring transport state {} for {} in state {}",
                state, peer, session.state
            );
            return;
        }

        match state {
            TransportState::Open => {
                session.reconnect_attempts = 0;
                info!("Direct channel open with {}", peer);
            }
            TransportState::Degraded => {
                warn!("Connection to {} degraded", peer);
            }
            _ => {}
        }

        self.emit(SessionEvent::StateChanged {
            peer: peer.to_string(),
            state,
        })
        .await;

        match state {
            TransportState::Failed => self.maybe_reconnect(peer).await,
            TransportState::Closed => {
                let deliberate = self
                    .sessions
                    .get(peer)
                    .map(|s| s.deliberate_close)
                    .unwrap_or(true);
                if deliberate {
                    self.sessions.remove(peer);
                    info!("Session with {} ended", peer);
                } else {
                    self.maybe_reconnect(peer).await;
                }
            }
            _ => {}
        }
    }

    async fn handle_channel_message(&mut self, peer: &str, message: ChannelMessage) {
        let Some(session) = self.sessions.get_mut(peer) else {
            debug!("Channel message from unknown peer {}", peer);
            return;
        };

        match message {
            ChannelMessage::Identity {
                stable_id,
                display_name,
            } => {
                let identity = Identity::new(stable_id, display_name);
                session.identity = Some(identity.clone());
                self.directory
                    .record_peer(&identity.stable_id, &identity.display_name)
                    .await;
                self.emit(SessionEvent::PeerIdentified {
                    peer: peer.to_string(),
                    identity,
                })
                .await;
            }
            ChannelMessage::DisconnectIntent => {
                // The peer is leaving on purpose; honor it by not chasing
                info!("{} announced a deliberate disconnect", peer);
                session.deliberate_close = true;
                self.rendezvous.block(peer).await;
            }
            ChannelMessage::Payload { data } => {
                self.emit(SessionEvent::Payload {
                    peer: peer.to_string(),
                    data,
                })
                .await;
            }
        }
    }

    /// Schedule a delayed reconnection attempt, or give up
    ///
    /// Only the initiating side reconnects; the hosting side stays passive
    /// and simply forgets the session.
    async fn maybe_reconnect(&mut self, peer: &str) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if session.deliberate_close || !session.initiator {
            self.sessions.remove(peer);
            // Closing the relay link tells a still-waiting dialer to redial
            self.rendezvous.close_link(peer).await;
            return;
        }
        if session.retry_pending {
            return;
        }
        if session.reconnect_attempts >= self.config.max_reconnect_attempts {
            warn!(
                "Giving up on {} after {} attempts",
                peer, session.reconnect_attempts
            );
            self.sessions.remove(peer);
            self.emit(SessionEvent::ReconnectExhausted {
                peer: peer.to_string(),
            })
            .await;
            return;
        }

        session.reconnect_attempts += 1;
        session.retry_pending = true;
        let attempt = session.reconnect_attempts;
        let delay = self.config.reconnect_delay(attempt);
        debug!(
            "Scheduling reconnect attempt {} towards {} in {:?}",
            attempt, peer, delay
        );

        let cmd_tx = self.cmd_tx.clone();
        let peer = peer.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(Command::Retry { peer, attempt }).await;
        });
    }

    /// Claim a relay address, retrying generated addresses on collision
    async fn claim_address(&self, address: Option<String>) -> Result<String> {
        match address {
            Some(address) => self.rendezvous.listen(Some(address)).await,
            None => {
                let mut last = engine_stopped();
                for _ in 0..ADDRESS_CLAIM_ATTEMPTS {
                    match self.rendezvous.listen(None).await {
                        Ok(address) => return Ok(address),
                        Err(e @ Error::AddressTaken(_)) => last = e,
                        Err(e) => return Err(e),
                    }
                }
                Err(last)
            }
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Application event receiver dropped");
        }
    }
}
