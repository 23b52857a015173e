//! Per-peer readiness bookkeeping

use std::collections::HashSet;

use crate::transport::PeerId;

/// The peers that reported ready. A peer missing from the set is not ready.
#[derive(Debug, Clone, Default)]
pub struct PeerReadiness {
    ready: HashSet<PeerId>,
}

impl PeerReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&mut self, peer: PeerId) {
        self.ready.insert(peer);
    }

    /// Remove `peer`'s entry. Returns whether an entry existed.
    ///
    /// The `broadcast` half of clearing (telling other peers that the local
    /// peer is no longer downloading) belongs to the controller, which owns
    /// the local player info.
    pub fn clear(&mut self, peer: PeerId) -> bool {
        self.ready.remove(&peer)
    }

    pub fn is_ready(&self, peer: PeerId) -> bool {
        self.ready.contains(&peer)
    }

    /// Whether every peer in `current_peers` is ready.
    /// Entries for peers no longer present are not consulted.
    pub fn all_ready(&self, current_peers: &[PeerId]) -> bool {
        current_peers.iter().all(|&peer| self.is_ready(peer))
    }

    pub fn clear_all(&mut self) {
        self.ready.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_peer_is_not_ready() {
        let readiness = PeerReadiness::new();
        assert!(!readiness.is_ready(PeerId(1)));
    }

    #[test]
    fn test_set_and_clear() {
        let mut readiness = PeerReadiness::new();
        readiness.set_ready(PeerId(1));
        assert!(readiness.is_ready(PeerId(1)));
        assert!(readiness.clear(PeerId(1)));
        assert!(!readiness.is_ready(PeerId(1)));
        assert!(!readiness.clear(PeerId(1)));
    }

    #[test]
    fn test_all_ready_tracks_current_members_only() {
        let mut readiness = PeerReadiness::new();
        readiness.set_ready(PeerId(1));
        readiness.set_ready(PeerId(3));

        assert!(readiness.all_ready(&[PeerId(1), PeerId(3)]));
        assert!(!readiness.all_ready(&[PeerId(1), PeerId(2), PeerId(3)]));
        // Peer 3 left; its stale entry does not matter
        assert!(readiness.all_ready(&[PeerId(1)]));
        assert!(readiness.all_ready(&[]));
    }

    #[test]
    fn test_clear_all() {
        let mut readiness = PeerReadiness::new();
        readiness.set_ready(PeerId(1));
        readiness.set_ready(PeerId(2));
        assert_eq!(readiness.ready_count(), 2);
        readiness.clear_all();
        assert!(readiness.is_empty());
        assert_eq!(readiness.ready_count(), 0);
    }
}
