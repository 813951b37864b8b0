use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Information about an active relay pair
#[derive(Debug, Clone)]
pub struct RelayInfo {
    /// Identifier assigned when the remote connection was accepted
    pub relay_id: u64,
    /// Remote peer as reported by the relay host
    pub peer: String,
    /// Local endpoint the pair was dialed to
    pub local_endpoint: String,
    /// Timestamp when the pair was established
    pub established_at: Instant,
}

/// Tracks live relay pairs and hands out relay ids
#[derive(Clone, Default)]
pub struct ActiveRelays {
    relays: Arc<RwLock<HashMap<u64, RelayInfo>>>,
    next_id: Arc<AtomicU64>,
}

impl ActiveRelays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next relay id, starting at 1
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a new relay pair
    pub async fn register(&self, info: RelayInfo) {
        let relay_id = info.relay_id;
        let peer = info.peer.clone();

        let mut relays = self.relays.write().await;
        relays.insert(relay_id, info);

        tracing::info!(
            relay_id = relay_id,
            peer = %peer,
            active_relays = relays.len(),
            "Relay registered"
        );
    }

    /// Unregister a relay pair once both directions are done
    pub async fn unregister(&self, relay_id: u64) {
        let mut relays = self.relays.write().await;

        if let Some(info) = relays.remove(&relay_id) {
            tracing::info!(
                relay_id = relay_id,
                peer = %info.peer,
                duration_ms = info.established_at.elapsed().as_millis() as u64,
                active_relays = relays.len(),
                "Relay unregistered"
            );
        } else {
            tracing::warn!(relay_id = relay_id, "Attempted to unregister unknown relay");
        }
    }

    /// Get the number of active relay pairs
    pub async fn count(&self) -> usize {
        self.relays.read().await.len()
    }

    /// Get all active relay pairs
    pub async fn list(&self) -> Vec<RelayInfo> {
        self.relays.read().await.values().cloned().collect()
    }
}
