//! Rendezvous and direct-channel wire types
//!
//! Three layers of envelope live here:
//!
//! - [`ClientFrame`] / [`ServerFrame`]: the JSON frames exchanged between a
//!   rendezvous client and the relay. The relay routes them without ever
//!   looking inside `payload`.
//! - [`NegotiationMessage`]: the offer/answer envelope carried as an opaque
//!   `payload` through the relay.
//! - [`ChannelMessage`]: the envelope for everything sent over the direct
//!   channel once it is open: the identity handshake, the disconnect-intent
//!   courtesy notice, and application payloads.

use serde::{Deserialize, Serialize};

/// Opaque connection-parameters blob produced by the negotiator
///
/// Compared for equality only; the orchestrator and relay never parse it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Description(pub String);

impl Description {
    /// Wrap a serialized description
    pub fn new(blob: impl Into<String>) -> Self {
        Self(blob.into())
    }

    /// The raw blob
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Relay-carried negotiation envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NegotiationMessage {
    /// Initiator's offer description
    Offer {
        /// Serialized local description, candidates included
        body: Description,
    },
    /// Responder's answer description
    Answer {
        /// Serialized local description, candidates included
        body: Description,
    },
}

impl NegotiationMessage {
    /// Serialize for relay transport
    pub fn to_value(&self) -> crate::Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize negotiation message: {}",
                e
            ))
        })
    }

    /// Parse from a relayed payload
    pub fn from_value(value: serde_json::Value) -> crate::Result<Self> {
        serde_json::from_value(value).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize negotiation message: {}",
                e
            ))
        })
    }
}

/// Messages carried over the direct channel, never the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Identity handshake, sent exactly once by each side on channel open
    Identity {
        /// Stable identifier, persistent across sessions
        stable_id: String,
        /// Human-readable display name
        display_name: String,
    },

    /// Courtesy notice that the sender is disconnecting on purpose,
    /// so the receiver should not attempt to reconnect
    DisconnectIntent,

    /// Opaque application payload
    Payload {
        /// Application bytes, base64 on the wire
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl ChannelMessage {
    /// Serialize to bytes for the direct channel
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize channel message: {}", e))
        })
    }

    /// Deserialize from bytes received on the direct channel
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize channel message: {}",
                e
            ))
        })
    }
}

/// Frames sent from a rendezvous client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Claim an address on the relay
    Listen {
        /// Requested address
        address: String,
    },

    /// Initiate a logical link to another address
    Connect {
        /// Target address
        to: String,
        /// Explicit/manual attempt; clears any block on the remote side
        #[serde(default)]
        manual: bool,
    },

    /// Accept an offered inbound link
    Accept {
        /// Address of the peer that initiated
        to: String,
    },

    /// Reject an offered inbound link
    Reject {
        /// Address of the peer that initiated
        to: String,
    },

    /// Relay an opaque payload to a linked peer
    Relay {
        /// Target address
        to: String,
        /// Opaque payload; the relay never inspects it
        payload: serde_json::Value,
    },

    /// Tear down a logical link
    Close {
        /// Target address
        to: String,
    },
}

/// Frames sent from the relay to a rendezvous client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Address claim succeeded
    ListenOk {
        /// The claimed address
        address: String,
    },

    /// Address claim failed: already in use
    AddressTaken {
        /// The contested address
        address: String,
    },

    /// A peer is offering a link to us
    Incoming {
        /// Address of the initiating peer
        from: String,
        /// Whether the attempt was tagged manual
        #[serde(default)]
        manual: bool,
    },

    /// A link we initiated was accepted
    Opened {
        /// Address of the accepting peer
        peer: String,
    },

    /// Relayed payload from a linked peer
    Message {
        /// Address of the sending peer
        from: String,
        /// Opaque payload
        payload: serde_json::Value,
    },

    /// A logical link closed (rejected, torn down, or the peer vanished)
    Closed {
        /// Address of the peer on the other end
        peer: String,
    },
}

/// Base64 wire encoding for opaque payload bytes
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_message_wire_shape() {
        let msg = NegotiationMessage::Offer {
            body: Description::new("v=0 ..."),
        };
        let value = msg.to_value().unwrap();
        assert_eq!(value["kind"], "offer");
        assert_eq!(value["body"], "v=0 ...");

        let parsed = NegotiationMessage::from_value(value).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn test_descriptions_compared_by_equality_only() {
        let a = Description::new("blob");
        let b = Description::new("blob");
        assert_eq!(a, b);
        assert_ne!(a, Description::new("other"));
    }

    #[test]
    fn test_channel_message_identity_round_trip() {
        let msg = ChannelMessage::Identity {
            stable_id: "guid-1".to_string(),
            display_name: "Alice".to_string(),
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(ChannelMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_channel_message_payload_is_base64_on_wire() {
        let msg = ChannelMessage::Payload {
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let bytes = msg.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("3q2+7w=="));
        assert_eq!(ChannelMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_disconnect_intent_tag() {
        let bytes = ChannelMessage::DisconnectIntent.to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("disconnect_intent"));
    }

    #[test]
    fn test_client_frame_manual_defaults_false() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"op":"connect","to":"123456"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Connect {
                to: "123456".to_string(),
                manual: false
            }
        );
    }

    #[test]
    fn test_server_frame_round_trip() {
        let frame = ServerFrame::Message {
            from: "abc".to_string(),
            payload: serde_json::json!({"kind": "offer", "body": "D1"}),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: ServerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, parsed);
    }
}
