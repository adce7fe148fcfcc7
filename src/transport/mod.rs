//! Direct transport layer
//!
//! Turns negotiation envelopes into direct peer channels. The [`Negotiator`]
//! trait is the seam between the orchestrator and the actual transport:
//! production uses [`WebRtcNegotiator`], tests use [`MockNegotiator`].

pub mod mock;
pub mod negotiator;
pub mod webrtc;

pub use mock::{MockNegotiator, MockNetwork};
pub use negotiator::{Negotiator, SendTarget, TransportEvent, TransportState};
pub use webrtc::WebRtcNegotiator;
