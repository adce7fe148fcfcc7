//! Configuration types for peerlink

use serde::{Deserialize, Serialize};

/// Main configuration for the session engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLinkConfig {
    /// WebSocket rendezvous relay URL (ws:// or wss://)
    pub relay_url: String,

    /// STUN server URLs used for candidate gathering
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Base reconnection delay in milliseconds; attempt N waits `base * N`
    pub reconnect_base_ms: u64,

    /// Maximum automatic reconnection attempts before the failure is terminal
    pub max_reconnect_attempts: u32,

    /// Maximum simultaneous peer sessions
    pub max_peers: u32,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for PeerLinkConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:9090".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
            reconnect_base_ms: 1000,
            max_reconnect_attempts: 5,
            max_peers: 16,
        }
    }
}

impl PeerLinkConfig {
    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if !self.relay_url.starts_with("ws://") && !self.relay_url.starts_with("wss://") {
            return Err(crate::Error::InvalidConfig(format!(
                "relay_url must start with ws:// or wss://, got: {}",
                self.relay_url
            )));
        }

        if self.reconnect_base_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "reconnect_base_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_peers == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_peers must be greater than 0".to_string(),
            ));
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(crate::Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got: {}",
                    turn.url
                )));
            }
        }

        Ok(())
    }

    /// Delay before reconnection attempt `attempt` (1-indexed)
    ///
    /// Linear backoff: the first retry waits `base`, the second `2 * base`,
    /// and so on. There is no cap on the delay itself; the attempt count is
    /// capped by `max_reconnect_attempts`.
    pub fn reconnect_delay(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_millis(self.reconnect_base_ms * attempt.max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        let config = PeerLinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_reconnect_attempts, 5);
    }

    #[test]
    fn test_invalid_relay_url() {
        let config = PeerLinkConfig {
            relay_url: "http://example.com".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_backoff_rejected() {
        let config = PeerLinkConfig {
            reconnect_base_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_turn_url() {
        let config = PeerLinkConfig {
            turn_servers: vec![TurnServerConfig {
                url: "stun:not-a-turn".to_string(),
                username: "u".to_string(),
                credential: "c".to_string(),
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_linear_reconnect_delay() {
        let config = PeerLinkConfig {
            reconnect_base_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(250));
        assert_eq!(config.reconnect_delay(3), Duration::from_millis(750));
        // attempt 0 is clamped to the base delay
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(250));
    }
}
