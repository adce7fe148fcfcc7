//! Error types for peerlink

/// Result type alias using the peerlink Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in peerlink operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Requested relay address is already claimed by another peer
    #[error("Relay address already taken: {0}")]
    AddressTaken(String),

    /// Negotiation call made out of order for the session's role
    #[error("Invalid negotiation state: {0}")]
    InvalidNegotiationState(String),

    /// Operation referenced a peer address with no active session
    #[error("No session for peer: {0}")]
    NoSuchSession(String),

    /// Rendezvous/relay link error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable by the caller
    ///
    /// `AddressTaken` is retryable with a different address; link-level
    /// faults are retryable after a delay. Protocol-order violations and
    /// exhausted reconnection are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::AddressTaken(_) | Error::SignalingError(_) | Error::IoError(_)
        )
    }

    /// Check if this error is a protocol-order violation (programming error)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidNegotiationState(_) | Error::NoSuchSession(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}
