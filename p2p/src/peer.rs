//! Peer management

use palisade_core::{PeerId, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Peer information
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub connected_at: Timestamp,
    pub last_seen: Timestamp,
    pub messages_received: u64,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId) -> Self {
        let now = Timestamp::now();
        Self {
            peer_id,
            connected_at: now,
            last_seen: now,
            messages_received: 0,
        }
    }

    pub fn is_stale(&self, timeout_ms: u64) -> bool {
        Timestamp::now().as_millis().saturating_sub(self.last_seen.as_millis()) > timeout_ms
    }
}

/// Peer manager for tracking connected peers
pub struct PeerManager {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    max_peers: usize,
}

impl PeerManager {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_peers,
        }
    }

    /// Add a peer; `false` when the limit is reached
    pub fn add_peer(&self, info: PeerInfo) -> bool {
        let mut peers = self.peers.write();
        if peers.len() >= self.max_peers && !peers.contains_key(&info.peer_id) {
            return false;
        }
        peers.insert(info.peer_id.clone(), info);
        true
    }

    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.peers.write().remove(peer_id);
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    /// Record traffic from a peer
    pub fn record_message(&self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.last_seen = Timestamp::now();
            peer.messages_received += 1;
        }
    }

    pub fn all_peers(&self) -> Vec<PeerInfo> {
        self.peers.read().values().cloned().collect()
    }

    pub fn remove_stale_peers(&self, timeout_ms: u64) -> Vec<PeerId> {
        let mut peers = self.peers.write();
        let stale: Vec<PeerId> = peers
            .values()
            .filter(|p| p.is_stale(timeout_ms))
            .map(|p| p.peer_id.clone())
            .collect();
        for id in &stale {
            peers.remove(id);
        }
        stale
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}

/// Shared peer manager
pub type SharedPeerManager = Arc<PeerManager>;

pub fn create_peer_manager(max_peers: usize) -> SharedPeerManager {
    Arc::new(PeerManager::new(max_peers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_manager() {
        let manager = PeerManager::new(2);
        assert!(manager.add_peer(PeerInfo::new(PeerId::new("a"))));
        assert!(manager.add_peer(PeerInfo::new(PeerId::new("b"))));
        assert!(!manager.add_peer(PeerInfo::new(PeerId::new("c"))));

        manager.record_message(&PeerId::new("a"));
        assert_eq!(manager.get_peer(&PeerId::new("a")).unwrap().messages_received, 1);

        manager.remove_peer(&PeerId::new("a"));
        assert!(!manager.is_connected(&PeerId::new("a")));
        assert_eq!(manager.peer_count(), 1);
        assert!(manager.remove_stale_peers(60_000).is_empty());
    }
}
