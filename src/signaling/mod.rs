//! Rendezvous (signaling) layer
//!
//! A rendezvous client claims an address on a relay, opens logical links to
//! other addresses, and exchanges small negotiation envelopes over them. The
//! relay never interprets payloads; all application traffic moves to the
//! direct channel once negotiation completes.

use async_trait::async_trait;

use crate::Result;

pub mod client;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod ws;

pub use client::{RelayEvent, RendezvousClient};
pub use protocol::{ChannelMessage, ClientFrame, Description, NegotiationMessage, ServerFrame};
pub use relay::{MemoryLink, MemoryRelay, RelayCore};
pub use server::{RelayServer, RelayServerHandle};
pub use ws::WsLink;

/// One client's connection to a relay
///
/// Abstracts the relay link (WebSocket in production, in-memory channels in
/// tests) so the rendezvous client logic is shared between them.
#[async_trait]
pub trait RelayLink: Send + Sync + 'static {
    /// Send a frame to the relay
    async fn send(&self, frame: ClientFrame) -> Result<()>;

    /// Receive the next frame from the relay; `None` when the link is down
    async fn recv(&self) -> Option<ServerFrame>;

    /// Tear down the link
    async fn close(&self);
}
