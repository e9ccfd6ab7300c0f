use std::{
    collections::{hash_map, HashMap},
    net::SocketAddr,
    time::Duration,
};

use crate::peer::{priority::canonical_peer_priority, CloseReason};

/// Where an address came from. Doubles as scheduling preference; lower
/// ranks are tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerSource {
    Incoming = 0,
    Tracker = 1,
    Dht = 2,
    Pex = 3,
    Hint = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Banned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanReason {
    Corruption,
    Manual,
}

const CONNECT_BACKOFF_BASE: Duration = Duration::from_secs(15);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(15 * 60);
/// Hashed pieces that failed verification before the address is banned
const CORRUPTION_BAN_THRESHOLD: u32 = 3;
/// Quick disconnects before the address goes to the back of the line
const QUICK_DISCONNECT_PENALTY: u32 = 3;
/// Ports that are practically never real bittorrent peers
const SUSPICIOUS_PORTS: [u16; 6] = [21, 22, 25, 80, 443, 8080];

/// One known address in the swarm
#[derive(Debug, Clone)]
pub struct SwarmPeer {
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub state: PeerState,
    pub connect_attempts: u32,
    pub failures: u32,
    pub quick_disconnects: u32,
    pub invalid_pieces: u32,
    pub last_connect_attempt: Option<Duration>,
    pub last_success: Option<Duration>,
    pub client_name: Option<String>,
    pub ban_reason: Option<BanReason>,
}

impl SwarmPeer {
    fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            source,
            state: PeerState::New,
            connect_attempts: 0,
            failures: 0,
            quick_disconnects: 0,
            invalid_pieces: 0,
            last_connect_attempt: None,
            last_success: None,
            client_name: None,
            ban_reason: None,
        }
    }

    fn backoff(&self) -> Duration {
        let exponent = self.failures.min(6);
        std::cmp::min(CONNECT_BACKOFF_BASE * 2u32.pow(exponent), CONNECT_BACKOFF_CAP)
    }

    fn is_dialable(&self, now: Duration) -> bool {
        match self.state {
            PeerState::Connecting | PeerState::Connected | PeerState::Banned => return false,
            PeerState::New | PeerState::Disconnected => {}
        }
        match self.last_connect_attempt {
            Some(at) => now.saturating_sub(at) >= self.backoff(),
            None => true,
        }
    }

    fn has_suspicious_port(&self) -> bool {
        SUSPICIOUS_PORTS.contains(&self.addr.port())
    }
}

/// All addresses known for one torrent plus the outgoing-connection
/// scheduler over them. Deduplicated by `addr:port`.
#[derive(Debug)]
pub struct Swarm {
    peers: HashMap<SocketAddr, SwarmPeer>,
    /// Our external address when a peer told us, feeds BEP 40 priorities
    my_addr: Option<SocketAddr>,
    connected: usize,
}

impl Swarm {
    const MAX_SIZE: usize = 2_000;

    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            my_addr: None,
            connected: 0,
        }
    }

    /// Returns whether the address is new
    pub fn add(&mut self, addr: SocketAddr, source: PeerSource) -> bool {
        if self.peers.len() >= Self::MAX_SIZE {
            tracing::debug!(
                "Not saving peer, swarm is full {}/{}",
                self.peers.len(),
                Self::MAX_SIZE
            );
            return false;
        }
        match self.peers.entry(addr) {
            hash_map::Entry::Occupied(mut entry) => {
                // prefer the stronger discovery source for scheduling
                let peer = entry.get_mut();
                if source < peer.source {
                    peer.source = source;
                }
                false
            }
            hash_map::Entry::Vacant(entry) => {
                entry.insert(SwarmPeer::new(addr, source));
                true
            }
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&SwarmPeer> {
        self.peers.get(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn connected_amount(&self) -> usize {
        self.connected
    }

    pub fn set_my_addr(&mut self, addr: SocketAddr) {
        self.my_addr = Some(addr);
    }

    pub fn my_addr(&self) -> Option<SocketAddr> {
        self.my_addr
    }

    /// Pick the next address to dial. Ordering: fewest failures, most
    /// recent success, clean port, source preference, BEP 40 priority.
    pub fn next_candidate(&mut self, now: Duration) -> Option<SocketAddr> {
        let my_addr = self.my_addr;
        let best = self
            .peers
            .values()
            .filter(|p| p.is_dialable(now))
            .min_by_key(|p| {
                let canonical = match my_addr {
                    Some(mine) => canonical_peer_priority(mine, p.addr),
                    None => 0,
                };
                (
                    p.failures + p.quick_disconnects.saturating_div(QUICK_DISCONNECT_PENALTY),
                    now.saturating_sub(p.last_success.unwrap_or_default()),
                    p.has_suspicious_port(),
                    p.source,
                    std::cmp::Reverse(canonical),
                )
            })
            .map(|p| p.addr)?;
        let peer = self.peers.get_mut(&best).expect("candidate is tracked");
        peer.state = PeerState::Connecting;
        peer.connect_attempts += 1;
        peer.last_connect_attempt = Some(now);
        Some(best)
    }

    /// Incoming connection landed; track the address as connected
    pub fn accept_incoming(&mut self, addr: SocketAddr, now: Duration) -> bool {
        self.add(addr, PeerSource::Incoming);
        let peer = self.peers.get_mut(&addr).expect("just inserted");
        if peer.state == PeerState::Banned {
            return false;
        }
        if peer.state == PeerState::Connected {
            // one live connection per address
            return false;
        }
        peer.state = PeerState::Connected;
        peer.last_success = Some(now);
        self.connected += 1;
        true
    }

    pub fn mark_connected(&mut self, addr: SocketAddr, now: Duration) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            debug_assert_eq!(peer.state, PeerState::Connecting);
            peer.state = PeerState::Connected;
            peer.last_success = Some(now);
            peer.failures = 0;
            self.connected += 1;
        }
    }

    pub fn set_client_name(&mut self, addr: SocketAddr, name: String) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.client_name = Some(name);
        }
    }

    /// Record a finished or failed connection
    pub fn mark_disconnected(
        &mut self,
        addr: SocketAddr,
        reason: CloseReason,
        was_quick: bool,
    ) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        if peer.state == PeerState::Connected {
            self.connected -= 1;
        }
        if peer.state != PeerState::Banned {
            peer.state = PeerState::Disconnected;
        }
        if reason.is_peer_fault() {
            peer.failures += 1;
        }
        if was_quick {
            peer.quick_disconnects += 1;
        }
    }

    /// Tally a corrupt piece against every contributor; returns the
    /// addresses that crossed the ban threshold
    pub fn record_corruption(&mut self, contributors: &[SocketAddr]) -> Vec<SocketAddr> {
        let mut banned = Vec::new();
        for addr in contributors {
            if let Some(peer) = self.peers.get_mut(addr) {
                peer.invalid_pieces += 1;
                if peer.invalid_pieces >= CORRUPTION_BAN_THRESHOLD
                    && peer.state != PeerState::Banned
                {
                    self.ban(*addr, BanReason::Corruption);
                    banned.push(*addr);
                }
            }
        }
        banned
    }

    pub fn ban(&mut self, addr: SocketAddr, reason: BanReason) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            if peer.state == PeerState::Connected {
                self.connected -= 1;
            }
            peer.state = PeerState::Banned;
            peer.ban_reason = Some(reason);
        }
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.peers
            .get(addr)
            .is_some_and(|p| p.state == PeerState::Banned)
    }

    pub fn peers(&self) -> impl Iterator<Item = &SwarmPeer> {
        self.peers.values()
    }
}

impl Default for Swarm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use crate::peer::CloseReason;

    use super::{BanReason, PeerSource, PeerState, Swarm};

    fn addr(last: u8, port: u16) -> SocketAddr {
        format!("10.0.0.{last}:{port}").parse().unwrap()
    }

    const NOW: Duration = Duration::from_secs(1_000);

    #[test]
    fn dedup_keeps_strongest_source() {
        let mut swarm = Swarm::new();
        assert!(swarm.add(addr(1, 6881), PeerSource::Pex));
        assert!(!swarm.add(addr(1, 6881), PeerSource::Tracker));
        assert_eq!(swarm.len(), 1);
        assert_eq!(
            swarm.get(&addr(1, 6881)).unwrap().source,
            PeerSource::Tracker
        );
        // weaker source does not downgrade
        swarm.add(addr(1, 6881), PeerSource::Hint);
        assert_eq!(
            swarm.get(&addr(1, 6881)).unwrap().source,
            PeerSource::Tracker
        );
    }

    #[test]
    fn candidate_ordering_prefers_clean_history_and_source() {
        let mut swarm = Swarm::new();
        swarm.add(addr(1, 6881), PeerSource::Hint);
        swarm.add(addr(2, 6881), PeerSource::Tracker);
        swarm.add(addr(3, 6881), PeerSource::Dht);

        // same failure counts: tracker wins over dht over hint
        let first = swarm.next_candidate(NOW).unwrap();
        assert_eq!(first, addr(2, 6881));
        let second = swarm.next_candidate(NOW).unwrap();
        assert_eq!(second, addr(3, 6881));
        let third = swarm.next_candidate(NOW).unwrap();
        assert_eq!(third, addr(1, 6881));
        // everyone is connecting now
        assert!(swarm.next_candidate(NOW).is_none());
    }

    #[test]
    fn suspicious_port_sorts_last() {
        let mut swarm = Swarm::new();
        swarm.add(addr(1, 80), PeerSource::Tracker);
        swarm.add(addr(2, 51413), PeerSource::Tracker);
        assert_eq!(swarm.next_candidate(NOW).unwrap(), addr(2, 51413));
    }

    #[test]
    fn failures_backoff_exponentially() {
        let mut swarm = Swarm::new();
        swarm.add(addr(1, 6881), PeerSource::Tracker);

        let dialed = swarm.next_candidate(NOW).unwrap();
        swarm.mark_disconnected(dialed, CloseReason::DialTimeout, false);
        // first retry needs 2x base seconds of backoff
        assert!(swarm.next_candidate(NOW + Duration::from_secs(15)).is_none());
        assert!(swarm
            .next_candidate(NOW + Duration::from_secs(31))
            .is_some());
        swarm.mark_disconnected(addr(1, 6881), CloseReason::DialTimeout, false);
        // second failure doubles it again
        let base = NOW + Duration::from_secs(31);
        assert!(swarm.next_candidate(base + Duration::from_secs(59)).is_none());
        assert!(swarm
            .next_candidate(base + Duration::from_secs(61))
            .is_some());
    }

    #[test]
    fn connected_peers_are_not_redialed() {
        let mut swarm = Swarm::new();
        swarm.add(addr(1, 6881), PeerSource::Tracker);
        let dialed = swarm.next_candidate(NOW).unwrap();
        swarm.mark_connected(dialed, NOW);
        assert_eq!(swarm.connected_amount(), 1);
        assert!(swarm.next_candidate(NOW + Duration::from_secs(600)).is_none());
        swarm.mark_disconnected(dialed, CloseReason::RemoteClosed, false);
        assert_eq!(swarm.connected_amount(), 0);
    }

    #[test]
    fn corruption_threshold_bans() {
        let mut swarm = Swarm::new();
        let peer = addr(1, 6881);
        swarm.add(peer, PeerSource::Tracker);
        assert!(swarm.record_corruption(&[peer]).is_empty());
        assert!(swarm.record_corruption(&[peer]).is_empty());
        let banned = swarm.record_corruption(&[peer]);
        assert_eq!(banned, vec![peer]);
        assert!(swarm.is_banned(&peer));
        assert_eq!(
            swarm.get(&peer).unwrap().ban_reason,
            Some(BanReason::Corruption)
        );
        // banned addresses never come back as candidates
        assert!(swarm
            .next_candidate(NOW + Duration::from_secs(10_000))
            .is_none());
        assert!(!swarm.accept_incoming(peer, NOW));
    }

    #[test]
    fn incoming_connection_is_tracked() {
        let mut swarm = Swarm::new();
        assert!(swarm.accept_incoming(addr(5, 40000), NOW));
        assert_eq!(swarm.connected_amount(), 1);
        assert_eq!(
            swarm.get(&addr(5, 40000)).unwrap().state,
            PeerState::Connected
        );
        // double connect from the same address is refused
        assert!(!swarm.accept_incoming(addr(5, 40000), NOW));
    }

    #[test]
    fn quick_disconnects_bias_ordering() {
        let mut swarm = Swarm::new();
        swarm.add(addr(1, 6881), PeerSource::Tracker);
        // flake 10.0.0.1 with quick disconnects that are nobody's fault
        let mut now = NOW;
        for _ in 0..3 {
            let dialed = swarm.next_candidate(now).unwrap();
            assert_eq!(dialed, addr(1, 6881));
            swarm.mark_connected(dialed, now);
            swarm.mark_disconnected(dialed, CloseReason::ShuttingDown, true);
            now += Duration::from_secs(120);
        }
        let peer1 = swarm.get(&addr(1, 6881)).unwrap();
        assert_eq!(peer1.quick_disconnects, 3);
        assert_eq!(peer1.failures, 0);

        swarm.add(addr(2, 6881), PeerSource::Tracker);
        let candidate = swarm.next_candidate(now).unwrap();
        assert_eq!(candidate, addr(2, 6881));
    }
}
