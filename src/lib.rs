//! peerlink: direct peer session engine
//!
//! Turns short-lived relayed rendezvous into direct, long-lived peer
//! channels. One side hosts at a relay address, the other joins with that
//! address; the engine negotiates a WebRTC data channel through the relay,
//! exchanges identities over it, and keeps the session alive with
//! joiner-side reconnection until one side leaves on purpose.
//!
//! # Example
//!
//! ```no_run
//! use peerlink::{start_engine, LocalIdentity, PeerLinkConfig, SessionEvent};
//!
//! # async fn run() -> peerlink::Result<()> {
//! let config = PeerLinkConfig::default();
//! let identity = LocalIdentity::generate("Alice");
//! let (engine, mut events) = start_engine(config, &identity).await?;
//!
//! let address = engine.host(None).await?;
//! println!("Share this join code: {}", address);
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Payload { peer, data } = event {
//!         engine.send_to(&peer, data).await?; // echo
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod identity;
pub mod session;
pub mod signaling;
pub mod transport;

use std::sync::Arc;

use tokio::sync::mpsc;

pub use config::{PeerLinkConfig, TurnServerConfig};
pub use directory::{PeerDirectory, PeerRecord};
pub use error::{Error, Result};
pub use identity::{Identity, IdentityProvider, LocalIdentity};
pub use session::{SessionEvent, SessionOrchestrator};
pub use signaling::{RelayServer, RendezvousClient, WsLink};
pub use transport::{TransportState, WebRtcNegotiator};

/// Start a production engine: WebSocket relay link plus WebRTC transport
///
/// Connects to the relay named in `config`, then wires the rendezvous
/// client, negotiator, and orchestrator together. Application events are
/// delivered on the returned receiver.
pub async fn start_engine(
    config: PeerLinkConfig,
    identity: &dyn IdentityProvider,
) -> Result<(SessionOrchestrator, mpsc::Receiver<SessionEvent>)> {
    config.validate()?;

    let link = WsLink::connect(&config.relay_url).await?;
    let (rendezvous, relay_events) = RendezvousClient::start(link);

    let (negotiator, transport_events) =
        WebRtcNegotiator::new(&config, identity.local_identity())?;

    Ok(SessionOrchestrator::start(
        config,
        rendezvous,
        relay_events,
        Arc::new(negotiator),
        transport_events,
    ))
}
