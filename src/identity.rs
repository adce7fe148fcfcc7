//! Local and remote peer identity
//!
//! Identities are self-reported: the stable id and display name a peer
//! announces after its channel opens are not verified in any way.

use serde::{Deserialize, Serialize};

/// A peer's self-reported identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable identifier, persistent across sessions
    pub stable_id: String,

    /// Human-readable display name
    pub display_name: String,
}

impl Identity {
    /// Create an identity from parts
    pub fn new(stable_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            stable_id: stable_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Supplies the local identity; consumed, never mutated, by the engine
pub trait IdentityProvider: Send + Sync {
    /// The identity announced to every peer after a channel opens
    fn local_identity(&self) -> Identity;
}

/// Default identity provider with a generated stable id
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    identity: Identity,
}

impl LocalIdentity {
    /// Generate a fresh stable id with the given display name
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self {
            identity: Identity::new(uuid::Uuid::new_v4().to_string(), display_name),
        }
    }

    /// Wrap an existing identity (e.g. restored from persistence)
    pub fn from_identity(identity: Identity) -> Self {
        Self { identity }
    }
}

impl IdentityProvider for LocalIdentity {
    fn local_identity(&self) -> Identity {
        self.identity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_has_stable_id() {
        let provider = LocalIdentity::generate("Alice");
        let identity = provider.local_identity();
        assert_eq!(identity.display_name, "Alice");
        assert!(!identity.stable_id.is_empty());
    }

    #[test]
    fn test_identity_is_stable_across_calls() {
        let provider = LocalIdentity::generate("Bob");
        assert_eq!(provider.local_identity(), provider.local_identity());
    }

    #[test]
    fn test_from_identity_round_trip() {
        let identity = Identity::new("guid-1", "Carol");
        let provider = LocalIdentity::from_identity(identity.clone());
        assert_eq!(provider.local_identity(), identity);
    }
}
