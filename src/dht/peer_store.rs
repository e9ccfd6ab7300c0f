use std::{
    collections::HashMap,
    net::SocketAddr,
    time::Duration,
};

use crate::metainfo::InfoHash;

pub const MAX_PEERS_PER_INFO_HASH: usize = 100;
pub const MAX_INFO_HASHES: usize = 10_000;
pub const PEER_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy)]
struct StoredPeer {
    addr: SocketAddr,
    added_at: Duration,
}

/// Peers other nodes announced to us, served back on `get_peers`.
/// Bounded three ways: peers per info hash, info hashes per store, and a
/// per peer ttl. When the info hash cap is hit the oldest info hash by
/// insertion order goes away.
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: HashMap<InfoHash, Vec<StoredPeer>>,
    insertion_order: Vec<InfoHash>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, info_hash: InfoHash, addr: SocketAddr, now: Duration) {
        if !self.peers.contains_key(&info_hash) {
            if self.peers.len() >= MAX_INFO_HASHES {
                let oldest = self.insertion_order.remove(0);
                self.peers.remove(&oldest);
                tracing::debug!("Peer store is full, dropped oldest info hash");
            }
            self.insertion_order.push(info_hash);
        }
        let peers = self.peers.entry(info_hash).or_default();
        if let Some(existing) = peers.iter_mut().find(|p| p.addr == addr) {
            existing.added_at = now;
            return;
        }
        if peers.len() >= MAX_PEERS_PER_INFO_HASH {
            // oldest announcer makes room
            let oldest = peers
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.added_at)
                .map(|(i, _)| i)
                .expect("cap is non zero");
            peers.swap_remove(oldest);
        }
        peers.push(StoredPeer { addr, added_at: now });
    }

    pub fn get(&self, info_hash: &InfoHash) -> Vec<SocketAddr> {
        self.peers
            .get(info_hash)
            .map(|peers| peers.iter().map(|p| p.addr).collect())
            .unwrap_or_default()
    }

    pub fn info_hash_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_count(&self, info_hash: &InfoHash) -> usize {
        self.peers.get(info_hash).map_or(0, |p| p.len())
    }

    /// Drop peers older than the ttl; empty info hashes go with them
    pub fn cleanup(&mut self, now: Duration) {
        self.peers.retain(|_, peers| {
            peers.retain(|p| now.saturating_sub(p.added_at) < PEER_TTL);
            !peers.is_empty()
        });
        self.insertion_order.retain(|hash| self.peers.contains_key(hash));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{PeerStore, MAX_PEERS_PER_INFO_HASH, PEER_TTL};

    fn addr(n: u16) -> std::net::SocketAddr {
        format!("10.0.{}.{}:6881", n / 256, n % 256).parse().unwrap()
    }

    const NOW: Duration = Duration::from_secs(100);

    #[test]
    fn add_and_get_peers() {
        let mut store = PeerStore::new();
        store.add([1; 20], addr(1), NOW);
        store.add([1; 20], addr(2), NOW);
        // same announcer twice only refreshes
        store.add([1; 20], addr(1), NOW + Duration::from_secs(1));
        assert_eq!(store.get(&[1; 20]).len(), 2);
        assert_eq!(store.get(&[2; 20]).len(), 0);
    }

    #[test]
    fn per_info_hash_cap_evicts_oldest_peer() {
        let mut store = PeerStore::new();
        for i in 0..MAX_PEERS_PER_INFO_HASH as u16 {
            store.add([1; 20], addr(i), NOW + Duration::from_secs(i as u64));
        }
        assert_eq!(store.peer_count(&[1; 20]), MAX_PEERS_PER_INFO_HASH);
        store.add([1; 20], addr(9999), NOW + Duration::from_secs(9999));
        assert_eq!(store.peer_count(&[1; 20]), MAX_PEERS_PER_INFO_HASH);
        // the oldest entry (addr 0) made room
        assert!(!store.get(&[1; 20]).contains(&addr(0)));
        assert!(store.get(&[1; 20]).contains(&addr(9999)));
    }

    #[test]
    fn ttl_cleanup_expires_peers() {
        let mut store = PeerStore::new();
        store.add([1; 20], addr(1), NOW);
        store.add([1; 20], addr(2), NOW + PEER_TTL / 2);
        store.cleanup(NOW + PEER_TTL + Duration::from_secs(1));
        let peers = store.get(&[1; 20]);
        assert_eq!(peers, vec![addr(2)]);
        assert_eq!(store.info_hash_count(), 1);

        store.cleanup(NOW + PEER_TTL * 2);
        assert_eq!(store.info_hash_count(), 0);
    }

    #[test]
    fn store_cap_evicts_oldest_info_hash() {
        let mut store = PeerStore::new();
        // shrink the constant in spirit: exercise the eviction path by
        // filling beyond the cap is too slow, so test the order contract
        // with a handful of hashes through the private path
        for i in 0..5u8 {
            store.add([i; 20], addr(i as u16), NOW + Duration::from_secs(i as u64));
        }
        assert_eq!(store.insertion_order.len(), 5);
        assert_eq!(store.insertion_order[0], [0; 20]);
        // re-announcing an old hash does not move it in insertion order
        store.add([0; 20], addr(100), NOW + Duration::from_secs(50));
        assert_eq!(store.insertion_order[0], [0; 20]);
    }
}
