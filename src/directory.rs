//! Known-peer directory
//!
//! Records every peer that has completed the identity exchange, keyed by
//! stable id. The orchestrator updates it on each received identity; the
//! application reads it to show "previously seen" peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::debug;

/// Directory entry for a known peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Display name at the time the peer was last seen
    pub display_name: String,

    /// Last-seen timestamp, milliseconds since the Unix epoch
    pub last_seen_ms: u64,
}

/// In-memory directory of peers seen by this process
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
}

impl PeerDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer sighting, overwriting any previous record
    pub async fn record_peer(&self, stable_id: &str, display_name: &str) {
        let record = PeerRecord {
            display_name: display_name.to_string(),
            last_seen_ms: now_ms(),
        };
        debug!("Recording peer {} ({})", stable_id, display_name);
        self.peers
            .write()
            .await
            .insert(stable_id.to_string(), record);
    }

    /// Snapshot of all known peers, keyed by stable id
    pub async fn list_peers(&self) -> HashMap<String, PeerRecord> {
        self.peers.read().await.clone()
    }

    /// Look up one peer by stable id
    pub async fn get_peer(&self, stable_id: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(stable_id).cloned()
    }

    /// Remove a peer; no-op if absent
    pub async fn remove_peer(&self, stable_id: &str) {
        self.peers.write().await.remove(stable_id);
    }

    /// Number of known peers
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether the directory is empty
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
