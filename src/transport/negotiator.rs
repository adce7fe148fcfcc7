//! Negotiator trait and transport state machine

use async_trait::async_trait;

use crate::signaling::{ChannelMessage, Description};
use crate::Result;

/// Lifecycle state of one peer's direct transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Session exists, negotiation not started
    New,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Direct channel open and usable
    Open,
    /// Connectivity lost, transport may still recover on its own
    Degraded,
    /// Negotiation or recovery failed; terminal
    Failed,
    /// Channel closed; terminal
    Closed,
}

impl TransportState {
    /// Terminal states are only left by starting a fresh attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }

    /// Whether a transition from `self` to `next` is legal
    ///
    /// Out-of-order notifications from a torn-down transport are filtered
    /// through this check and discarded.
    pub fn can_transition(&self, next: TransportState) -> bool {
        use TransportState::*;
        matches!(
            (self, next),
            (New, Negotiating)
                | (Negotiating, Open)
                | (Negotiating, Failed)
                | (Open, Degraded)
                | (Degraded, Open)
                | (New | Negotiating | Open | Degraded, Closed)
        )
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportState::New => "new",
            TransportState::Negotiating => "negotiating",
            TransportState::Open => "open",
            TransportState::Degraded => "degraded",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Delivery target for a channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// One peer by address
    Peer(String),
    /// Every peer with an open channel, best effort
    Broadcast,
}

/// Notifications from the transport to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The transport for `peer` observed a state change
    StateChanged {
        /// Peer address
        peer: String,
        /// New state as the transport sees it; the orchestrator's state
        /// machine decides whether to apply it
        state: TransportState,
    },
    /// A channel message arrived from `peer`
    Message {
        /// Peer address
        peer: String,
        /// Decoded channel message
        message: ChannelMessage,
    },
}

/// Per-peer direct transport negotiation and delivery
///
/// Descriptions are opaque blobs: produced on one side, applied verbatim on
/// the other. Each description is self-contained, so negotiation costs one
/// relay round-trip per direction. Events are delivered on the receiver
/// handed out at construction.
#[async_trait]
pub trait Negotiator: Send + Sync + 'static {
    /// Start an attempt towards `peer` as initiator and produce the offer
    ///
    /// Any previous transport for `peer` is discarded first.
    async fn create_offer(&self, peer: &str) -> Result<Description>;

    /// Start an attempt towards `peer` as responder and produce the answer
    async fn create_answer(&self, peer: &str, offer: Description) -> Result<Description>;

    /// Apply the remote answer to the initiator-side attempt for `peer`
    async fn accept_answer(&self, peer: &str, answer: Description) -> Result<()>;

    /// Send a channel message
    ///
    /// Fails for a [`SendTarget::Peer`] without an open channel; broadcast
    /// skips unusable channels silently.
    async fn send(&self, target: SendTarget, message: &ChannelMessage) -> Result<()>;

    /// Tear down the transport for `peer`; idempotent
    ///
    /// Emits a final `Closed` state change locally, then suppresses every
    /// later notification from the discarded transport.
    async fn disconnect(&self, peer: &str);
}
