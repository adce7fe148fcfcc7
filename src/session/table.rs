//! Per-peer session bookkeeping
//!
//! Owned exclusively by the orchestrator loop, so no locking: every read
//! and write happens on the event loop.

use std::collections::HashMap;

use crate::identity::Identity;
use crate::transport::TransportState;
use crate::{Error, Result};

/// One peer's session: transport state plus lifecycle bookkeeping
#[derive(Debug, Clone)]
pub struct PeerSession {
    /// Relay address of the peer
    pub peer_address: String,

    /// Current transport state
    pub state: TransportState,

    /// Identity received over the channel, once the peer announces it
    pub identity: Option<Identity>,

    /// Whether this side initiated the session (and therefore offers
    /// and auto-reconnects)
    pub initiator: bool,

    /// Reconnection attempts consumed since the last successful open
    pub reconnect_attempts: u32,

    /// The teardown is deliberate (ours or announced by the peer);
    /// suppresses reconnection
    pub deliberate_close: bool,

    /// A delayed retry has been scheduled and not yet dispatched
    pub retry_pending: bool,
}

impl PeerSession {
    fn new(peer_address: String, initiator: bool) -> Self {
        Self {
            peer_address,
            state: TransportState::New,
            identity: None,
            initiator,
            reconnect_attempts: 0,
            deliberate_close: false,
            retry_pending: false,
        }
    }

    /// Apply a state change if legal; returns whether it was applied
    pub fn apply_state(&mut self, next: TransportState) -> bool {
        if self.state.can_transition(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Reset the session for a fresh connection attempt, keeping the
    /// reconnection counter
    pub fn reset_for_attempt(&mut self) {
        self.state = TransportState::New;
    }
}

/// All live sessions, keyed by peer address
#[derive(Debug)]
pub struct SessionTable {
    sessions: HashMap<String, PeerSession>,
    capacity: usize,
}

impl SessionTable {
    /// Create a table holding at most `capacity` sessions
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            capacity,
        }
    }

    /// Whether a new session can be admitted
    pub fn has_capacity(&self) -> bool {
        self.sessions.len() < self.capacity
    }

    /// Create a session for `peer`; fails at capacity
    pub fn create(&mut self, peer: &str, initiator: bool) -> Result<&mut PeerSession> {
        if !self.sessions.contains_key(peer) && !self.has_capacity() {
            return Err(Error::SignalingError(format!(
                "Session limit of {} reached",
                self.capacity
            )));
        }
        Ok(self
            .sessions
            .entry(peer.to_string())
            .or_insert_with(|| PeerSession::new(peer.to_string(), initiator)))
    }

    pub fn get(&self, peer: &str) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &str) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer)
    }

    pub fn remove(&mut self, peer: &str) -> Option<PeerSession> {
        self.sessions.remove(peer)
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Peer addresses of all live sessions
    pub fn peers(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Snapshot of (peer, state) pairs
    pub fn states(&self) -> Vec<(String, TransportState)> {
        self.sessions
            .iter()
            .map(|(k, v)| (k.clone(), v.state))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_enforced() {
        let mut table = SessionTable::new(2);
        table.create("a", true).unwrap();
        table.create("b", true).unwrap();
        assert!(table.create("c", true).is_err());

        // Existing sessions are always reachable
        assert!(table.create("a", true).is_ok());

        table.remove("a");
        assert!(table.create("c", true).is_ok());
    }

    #[test]
    fn test_apply_state_filters_illegal_transitions() {
        let mut table = SessionTable::new(4);
        let session = table.create("a", true).unwrap();

        assert!(session.apply_state(TransportState::Negotiating));
        assert!(session.apply_state(TransportState::Open));
        // Stale failure from a discarded attempt must not apply
        assert!(!session.apply_state(TransportState::Failed));
        assert_eq!(session.state, TransportState::Open);
    }

    #[test]
    fn test_reset_for_attempt_leaves_terminal_state() {
        let mut table = SessionTable::new(4);
        let session = table.create("a", true).unwrap();
        session.apply_state(TransportState::Negotiating);
        session.apply_state(TransportState::Failed);
        assert!(session.state.is_terminal());

        session.reset_for_attempt();
        assert_eq!(session.state, TransportState::New);
        assert!(session.apply_state(TransportState::Negotiating));
    }
}
