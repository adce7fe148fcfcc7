//! Session orchestration
//!
//! The orchestrator multiplexes the rendezvous client and the negotiator
//! into per-peer sessions and drives each one through its lifecycle.

pub mod orchestrator;
pub mod table;

pub use orchestrator::{SessionEvent, SessionOrchestrator};
pub use table::{PeerSession, SessionTable};
