//! Mainline DHT node (BEP 5): KRPC server, iterative lookups, routing
//! table upkeep, token lifecycle and announce storage. Driven entirely
//! from the engine tick; the only I/O is the single injected udp socket.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    caps::{Entropy, UdpChannel},
    metainfo::InfoHash,
};

pub mod id;
pub mod krpc;
pub mod lookup;
pub mod peer_store;
pub mod routing;
pub mod token;
pub mod transactions;

use id::NodeId;
use krpc::{DhtQuery, DhtResponse, GetPeersValues, KrpcMessage, KrpcPayload};
use lookup::{Lookup, LookupResult};
use peer_store::PeerStore;
use routing::{AddOutcome, DhtNode, RoutingTable, K};
use token::TokenStore;
use transactions::{PendingQuery, QueryPurpose, TransactionManager};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const BUCKET_REFRESH_AGE: Duration = Duration::from_secs(15 * 60);
/// Wall clock running ahead of the monotonic clock by this much means
/// the host slept
const WAKE_MARGIN_MS: u64 = 2_000;
const SHORT_WAKE: Duration = Duration::from_secs(15 * 60);
const STALENESS_WINDOW: usize = 20;
const STALENESS_FAILURE_RATE: f32 = 0.9;
const BOOTSTRAP_MAX_ITERATIONS: usize = 20;

#[derive(Debug)]
pub enum DhtEvent {
    PeersFound {
        info_hash: InfoHash,
        peers: Vec<SocketAddr>,
    },
    Announced {
        info_hash: InfoHash,
        succeeded: usize,
        total: usize,
    },
    Bootstrapped {
        routing_nodes: usize,
    },
}

#[derive(Debug)]
enum LookupGoal {
    /// Find peers for a torrent, optionally announcing ourselves after
    Peers {
        info_hash: InfoHash,
        announce_port: Option<u16>,
    },
    /// Keep a quiet bucket warm
    Refresh,
    /// (Re)populate the routing table around our own id
    Bootstrap,
}

#[derive(Debug)]
struct LookupTask {
    lookup: Lookup,
    goal: LookupGoal,
    iterations: usize,
}

#[derive(Debug)]
struct AnnounceRun {
    pending: usize,
    succeeded: usize,
    total: usize,
}

/// Serialized shape of `session:dht:state`
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedDht {
    pub node_id_hex: String,
    pub nodes: Vec<PersistedNode>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedNode {
    pub id: String,
    pub host: String,
    pub port: u16,
}

pub struct Dht {
    node_id: NodeId,
    socket: Box<dyn UdpChannel>,
    datagrams: flume::Receiver<(SocketAddr, Bytes)>,
    entropy: Arc<dyn Entropy>,
    routing: RoutingTable,
    tokens: TokenStore,
    peer_store: PeerStore,
    transactions: TransactionManager,
    lookups: HashMap<u64, LookupTask>,
    next_lookup: u64,
    announces: HashMap<InfoHash, AnnounceRun>,
    bootstrap_nodes: Vec<SocketAddr>,
    /// Bittorrent listen port sent in announce_peer
    listen_port: u16,
    events: Vec<DhtEvent>,
    last_maintenance: Duration,
    /// Clock pair from the previous tick, for sleep detection
    last_wall_ms: u64,
    last_monotonic: Duration,
    /// Outcome ring of recent outgoing queries
    recent_results: VecDeque<bool>,
    rebootstrapping: bool,
}

impl std::fmt::Debug for Dht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dht")
            .field("node_id", &hex::encode(self.node_id))
            .field("routing_nodes", &self.routing.node_count())
            .field("lookups", &self.lookups.len())
            .finish()
    }
}

impl Dht {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        socket: Box<dyn UdpChannel>,
        datagrams: flume::Receiver<(SocketAddr, Bytes)>,
        entropy: Arc<dyn Entropy>,
        bootstrap_nodes: Vec<SocketAddr>,
        listen_port: u16,
        now: Duration,
        now_wall_ms: u64,
    ) -> Self {
        let tokens = TokenStore::new(entropy.as_ref(), now);
        Self {
            node_id,
            socket,
            datagrams,
            entropy,
            routing: RoutingTable::new(node_id, now),
            tokens,
            peer_store: PeerStore::new(),
            transactions: TransactionManager::new(),
            lookups: HashMap::new(),
            next_lookup: 0,
            announces: HashMap::new(),
            bootstrap_nodes,
            listen_port,
            events: Vec::new(),
            last_maintenance: now,
            last_wall_ms: now_wall_ms,
            last_monotonic: now,
            recent_results: VecDeque::with_capacity(STALENESS_WINDOW),
            rebootstrapping: false,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn routing_nodes(&self) -> usize {
        self.routing.node_count()
    }

    pub fn take_events(&mut self) -> Vec<DhtEvent> {
        std::mem::take(&mut self.events)
    }

    /// Populate the routing table from the configured seed hosts
    pub fn bootstrap(&mut self, now: Duration) {
        let mut seeds: Vec<DhtNode> = self
            .bootstrap_nodes
            .iter()
            .map(|addr| DhtNode::new(id::random_id(self.entropy.as_ref()), *addr, now))
            .collect();
        seeds.extend(self.routing.closest(&self.node_id, K));
        if seeds.is_empty() {
            tracing::warn!("Dht bootstrap has no seed nodes");
            return;
        }
        let lookup = Lookup::new(self.node_id, seeds);
        self.start_lookup(lookup, LookupGoal::Bootstrap, now);
    }

    /// Iterative get_peers; results arrive as [DhtEvent::PeersFound].
    /// With `announce_port` set, announce_peer follows the lookup.
    pub fn find_peers(&mut self, info_hash: InfoHash, announce_port: Option<u16>, now: Duration) {
        let seeds = self.routing.closest(&info_hash, K);
        if seeds.is_empty() {
            tracing::debug!("No dht nodes known, deferring lookup until bootstrap");
        }
        let lookup = Lookup::new(info_hash, seeds);
        self.start_lookup(
            lookup,
            LookupGoal::Peers {
                info_hash,
                announce_port,
            },
            now,
        );
    }

    fn start_lookup(&mut self, lookup: Lookup, goal: LookupGoal, now: Duration) {
        let lookup_id = self.next_lookup;
        self.next_lookup += 1;
        let mut task = LookupTask {
            lookup,
            goal,
            iterations: 0,
        };
        self.pump_lookup(lookup_id, &mut task, now);
        self.lookups.insert(lookup_id, task);
    }

    /// One engine tick: drain datagrams, advance lookups, reap timeouts,
    /// run the maintenance sweep
    pub fn tick(&mut self, now: Duration, now_wall_ms: u64) {
        while let Ok((from, bytes)) = self.datagrams.try_recv() {
            self.handle_datagram(from, bytes, now);
        }

        for timed_out in self.transactions.reap_timed_out(now) {
            self.handle_query_failure(timed_out, now);
        }

        self.drive_lookups(now);

        if now.saturating_sub(self.last_maintenance) >= MAINTENANCE_INTERVAL {
            self.last_maintenance = now;
            self.maintenance(now, now_wall_ms);
        }
        self.detect_wake(now, now_wall_ms);
    }

    fn drive_lookups(&mut self, now: Duration) {
        let ids: Vec<u64> = self.lookups.keys().copied().collect();
        for lookup_id in ids {
            let mut task = self.lookups.remove(&lookup_id).expect("key just listed");
            if task.lookup.is_converged() || task.iterations > BOOTSTRAP_MAX_ITERATIONS {
                self.finish_lookup(task, now);
                continue;
            }
            self.pump_lookup(lookup_id, &mut task, now);
            self.lookups.insert(lookup_id, task);
        }
    }

    fn pump_lookup(&mut self, lookup_id: u64, task: &mut LookupTask, now: Duration) {
        let queries = task.lookup.next_queries();
        if !queries.is_empty() {
            task.iterations += 1;
        }
        let target = task.lookup.target;
        let is_peers_lookup = matches!(task.goal, LookupGoal::Peers { .. });
        for (_, addr) in queries {
            let tid = self
                .transactions
                .issue(addr, QueryPurpose::Lookup { lookup: lookup_id }, now);
            let query = if is_peers_lookup {
                KrpcMessage::query(
                    tid,
                    "get_peers",
                    DhtQuery::GetPeers {
                        id: Bytes::copy_from_slice(&self.node_id),
                        info_hash: Bytes::copy_from_slice(&target),
                    },
                )
            } else {
                KrpcMessage::query(
                    tid,
                    "find_node",
                    DhtQuery::FindNode {
                        id: Bytes::copy_from_slice(&self.node_id),
                        target: Bytes::copy_from_slice(&target),
                    },
                )
            };
            self.socket.send_to(addr, query.to_bytes());
        }
    }

    fn finish_lookup(&mut self, task: LookupTask, now: Duration) {
        let result = task.lookup.finish();
        match task.goal {
            LookupGoal::Peers {
                info_hash,
                announce_port,
            } => {
                tracing::debug!(
                    info_hash = hex::encode(info_hash),
                    peers = result.peers.len(),
                    "Dht peer lookup finished"
                );
                if !result.peers.is_empty() {
                    self.events.push(DhtEvent::PeersFound {
                        info_hash,
                        peers: result.peers.clone(),
                    });
                }
                if let Some(port) = announce_port {
                    self.announce(info_hash, port, &result, now);
                }
            }
            LookupGoal::Refresh => {}
            LookupGoal::Bootstrap => {
                self.rebootstrapping = false;
                tracing::info!(
                    routing_nodes = self.routing.node_count(),
                    "Dht bootstrap finished"
                );
                self.events.push(DhtEvent::Bootstrapped {
                    routing_nodes: self.routing.node_count(),
                });
            }
        }
    }

    /// Send announce_peer to every lookup responder that gave us a token
    fn announce(&mut self, info_hash: InfoHash, port: u16, result: &LookupResult, now: Duration) {
        let mut total = 0;
        for (_, addr) in &result.closest {
            let Some(token) = result.tokens.get(addr) else {
                continue;
            };
            total += 1;
            let tid = self
                .transactions
                .issue(*addr, QueryPurpose::Announce { info_hash }, now);
            let query = KrpcMessage::query(
                tid,
                "announce_peer",
                DhtQuery::AnnouncePeer {
                    id: Bytes::copy_from_slice(&self.node_id),
                    implied_port: Some(0),
                    info_hash: Bytes::copy_from_slice(&info_hash),
                    port,
                    token: token.clone(),
                },
            );
            self.socket.send_to(*addr, query.to_bytes());
        }
        if total == 0 {
            self.events.push(DhtEvent::Announced {
                info_hash,
                succeeded: 0,
                total: 0,
            });
        } else {
            self.announces.insert(
                info_hash,
                AnnounceRun {
                    pending: total,
                    succeeded: 0,
                    total,
                },
            );
        }
    }

    fn announce_step(&mut self, info_hash: InfoHash, succeeded: bool) {
        let Some(run) = self.announces.get_mut(&info_hash) else {
            return;
        };
        run.pending -= 1;
        if succeeded {
            run.succeeded += 1;
        }
        if run.pending == 0 {
            let run = self.announces.remove(&info_hash).expect("entry exists");
            self.events.push(DhtEvent::Announced {
                info_hash,
                succeeded: run.succeeded,
                total: run.total,
            });
        }
    }

    fn handle_datagram(&mut self, from: SocketAddr, bytes: Bytes, now: Duration) {
        let message = match KrpcMessage::from_bytes(&bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!(%from, "Undecodable krpc datagram: {e}");
                self.reject_unknown_method(from, &bytes);
                return;
            }
        };
        match &message.payload {
            KrpcPayload::Query { .. } => self.handle_query(from, message, now),
            KrpcPayload::Response { .. } | KrpcPayload::Error { .. } => {
                self.handle_reply(from, message, now)
            }
        }
    }

    fn handle_reply(&mut self, from: SocketAddr, message: KrpcMessage, now: Duration) {
        let Some(pending) = self.transactions.resolve(&message.transaction_id, from) else {
            tracing::trace!(%from, "Reply without a matching transaction");
            return;
        };
        let is_error = matches!(message.payload, KrpcPayload::Error { .. });
        self.push_query_result(!is_error, now);
        if is_error {
            self.handle_query_failure(pending, now);
            return;
        }
        let Some(sender_id) = message.sender_id() else {
            self.handle_query_failure(pending, now);
            return;
        };
        self.add_node(sender_id, from, now);
        self.routing.mark_responded(from, now);

        match pending.purpose {
            QueryPurpose::Ping { .. } => {}
            QueryPurpose::Announce { info_hash } => self.announce_step(info_hash, true),
            QueryPurpose::Lookup { lookup } => {
                let Some(task) = self.lookups.get_mut(&lookup) else {
                    return;
                };
                let KrpcPayload::Response { response } = &message.payload else {
                    unreachable!("errors were routed to failure handling");
                };
                let mut closer_nodes = Vec::new();
                let mut peers = Vec::new();
                let mut token = None;
                match response {
                    DhtResponse::FindNode { nodes, .. } => {
                        closer_nodes = krpc::decode_compact_nodes(nodes);
                    }
                    DhtResponse::GetPeers {
                        token: node_token,
                        values,
                        ..
                    } => {
                        token = Some(node_token.clone());
                        match values {
                            GetPeersValues::Values(compact_peers) => {
                                peers = compact_peers
                                    .iter()
                                    .filter_map(|p| krpc::decode_compact_peer(p))
                                    .collect();
                            }
                            GetPeersValues::Nodes(nodes) => {
                                closer_nodes = krpc::decode_compact_nodes(nodes);
                            }
                        }
                    }
                    DhtResponse::PingOrAnnounce { .. } => {}
                }
                task.lookup
                    .on_response(sender_id, from, closer_nodes, peers, token);
            }
        }
    }

    fn handle_query_failure(&mut self, pending: PendingQuery, now: Duration) {
        self.push_query_result(false, now);
        if matches!(pending.purpose, QueryPurpose::Ping { strict: true }) {
            // post-wake probes do not get a second chance
            self.routing.remove(pending.addr);
        } else if self.routing.record_failure(pending.addr) {
            tracing::trace!(addr = %pending.addr, "Evicted failing dht node");
        }
        match pending.purpose {
            QueryPurpose::Ping { .. } => {}
            QueryPurpose::Announce { info_hash } => self.announce_step(info_hash, false),
            QueryPurpose::Lookup { lookup } => {
                if let Some(task) = self.lookups.get_mut(&lookup) {
                    task.lookup.on_failure();
                }
            }
        }
    }

    /// Server side of the four standard queries
    fn handle_query(&mut self, from: SocketAddr, message: KrpcMessage, now: Duration) {
        let KrpcPayload::Query { method, arguments } = &message.payload else {
            return;
        };
        if let Some(sender_id) = message.sender_id() {
            self.add_node(sender_id, from, now);
        }
        let tid = message.transaction_id.clone();
        let my_id = Bytes::copy_from_slice(&self.node_id);
        let reply = match arguments {
            DhtQuery::Ping { .. } => {
                KrpcMessage::response(tid, DhtResponse::PingOrAnnounce { id: my_id })
            }
            DhtQuery::FindNode { target, .. } => {
                let Ok(target) = <NodeId>::try_from(&target[..]) else {
                    return self.send_error(from, tid, krpc::ERROR_PROTOCOL, "bad target");
                };
                let closest: Vec<_> = self
                    .routing
                    .closest(&target, K)
                    .into_iter()
                    .map(|n| (n.id, n.addr))
                    .collect();
                KrpcMessage::response(
                    tid,
                    DhtResponse::FindNode {
                        id: my_id,
                        nodes: krpc::encode_compact_nodes(&closest),
                    },
                )
            }
            DhtQuery::GetPeers { info_hash, .. } => {
                let Ok(info_hash) = <NodeId>::try_from(&info_hash[..]) else {
                    return self.send_error(from, tid, krpc::ERROR_PROTOCOL, "bad info_hash");
                };
                let token = self.tokens.generate(&from);
                let known_peers = self.peer_store.get(&info_hash);
                let values = if known_peers.is_empty() {
                    let closest: Vec<_> = self
                        .routing
                        .closest(&info_hash, K)
                        .into_iter()
                        .map(|n| (n.id, n.addr))
                        .collect();
                    GetPeersValues::Nodes(krpc::encode_compact_nodes(&closest))
                } else {
                    GetPeersValues::Values(
                        known_peers
                            .into_iter()
                            .filter_map(|addr| {
                                krpc::encode_compact_peer(addr)
                                    .map(|c| Bytes::copy_from_slice(&c))
                            })
                            .collect(),
                    )
                };
                KrpcMessage::response(
                    tid,
                    DhtResponse::GetPeers {
                        id: my_id,
                        token,
                        values,
                    },
                )
            }
            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
                ..
            } => {
                let Ok(info_hash) = <NodeId>::try_from(&info_hash[..]) else {
                    return self.send_error(from, tid, krpc::ERROR_PROTOCOL, "bad info_hash");
                };
                if !self.tokens.validate(&from, token) {
                    return self.send_error(from, tid, krpc::ERROR_PROTOCOL, "bad token");
                }
                let peer_port = match implied_port {
                    Some(implied) if *implied != 0 => from.port(),
                    _ => *port,
                };
                let mut peer_addr = from;
                peer_addr.set_port(peer_port);
                self.peer_store.add(info_hash, peer_addr, now);
                KrpcMessage::response(tid, DhtResponse::PingOrAnnounce { id: my_id })
            }
        };
        tracing::trace!(%from, %method, "Answered dht query");
        self.socket.send_to(from, reply.to_bytes());
    }

    fn send_error(&mut self, to: SocketAddr, tid: Bytes, code: i64, message: &str) {
        let reply = KrpcMessage::error(tid, code, message);
        self.socket.send_to(to, reply.to_bytes());
    }

    /// Queries whose method or arguments we do not understand still get
    /// a 204 as long as the envelope carries a transaction id
    fn reject_unknown_method(&mut self, from: SocketAddr, bytes: &[u8]) {
        #[derive(Deserialize)]
        struct Envelope {
            t: Bytes,
            y: String,
        }
        let Ok(envelope) = serde_bencode::from_bytes::<Envelope>(bytes) else {
            return;
        };
        if envelope.y == "q" {
            self.send_error(from, envelope.t, krpc::ERROR_METHOD_UNKNOWN, "method unknown");
        }
    }

    fn add_node(&mut self, node_id: NodeId, addr: SocketAddr, now: Duration) {
        match self.routing.add(node_id, addr, now) {
            AddOutcome::Full { ping } => {
                // the least recently seen node gets a liveness check; it
                // is evicted through the failure path when it stays quiet
                self.send_ping(ping, false, now);
            }
            AddOutcome::Added | AddOutcome::Refreshed | AddOutcome::Ignored => {}
        }
    }

    /// Probe a node we heard about out of band (PORT messages)
    pub fn ping_node(&mut self, addr: SocketAddr, now: Duration) {
        self.send_ping(addr, false, now);
    }

    fn send_ping(&mut self, addr: SocketAddr, strict: bool, now: Duration) {
        let tid = self.transactions.issue(addr, QueryPurpose::Ping { strict }, now);
        let query = KrpcMessage::query(
            tid,
            "ping",
            DhtQuery::Ping {
                id: Bytes::copy_from_slice(&self.node_id),
            },
        );
        self.socket.send_to(addr, query.to_bytes());
    }

    fn push_query_result(&mut self, success: bool, now: Duration) {
        if self.recent_results.len() == STALENESS_WINDOW {
            self.recent_results.pop_front();
        }
        self.recent_results.push_back(success);

        if self.recent_results.len() < STALENESS_WINDOW || self.rebootstrapping {
            return;
        }
        let failures = self.recent_results.iter().filter(|ok| !**ok).count();
        if failures as f32 >= STALENESS_FAILURE_RATE * STALENESS_WINDOW as f32 {
            tracing::warn!("Dht looks stale ({failures}/{STALENESS_WINDOW} failures), re-bootstrapping");
            self.recent_results.clear();
            self.rebootstrapping = true;
            // public seeds only; the surviving table is likely garbage
            let seeds: Vec<DhtNode> = self
                .bootstrap_nodes
                .iter()
                .map(|addr| DhtNode::new(id::random_id(self.entropy.as_ref()), *addr, now))
                .collect();
            if !seeds.is_empty() {
                let lookup = Lookup::new(self.node_id, seeds);
                self.start_lookup(lookup, LookupGoal::Bootstrap, now);
            }
        }
    }

    fn maintenance(&mut self, now: Duration, _now_wall_ms: u64) {
        self.tokens.maybe_rotate(now, self.entropy.as_ref());
        self.peer_store.cleanup(now);

        // quiet buckets get a find_node towards a random id they cover
        for (min, mask) in self.routing.stale_buckets(now, BUCKET_REFRESH_AGE) {
            let target = id::random_id_in_range(&min, &mask, self.entropy.as_ref());
            let seeds = self.routing.closest(&target, K);
            if seeds.is_empty() {
                continue;
            }
            tracing::debug!("Refreshing stale dht bucket");
            self.routing.touch_bucket(&target, now);
            let lookup = Lookup::new(target, seeds);
            self.start_lookup(lookup, LookupGoal::Refresh, now);
        }
    }

    fn detect_wake(&mut self, now: Duration, now_wall_ms: u64) {
        let mono_delta_ms = now.saturating_sub(self.last_monotonic).as_millis() as u64;
        let wall_delta_ms = now_wall_ms.saturating_sub(self.last_wall_ms);
        self.last_monotonic = now;
        self.last_wall_ms = now_wall_ms;

        if wall_delta_ms <= mono_delta_ms + WAKE_MARGIN_MS {
            return;
        }
        let slept = Duration::from_millis(wall_delta_ms - mono_delta_ms);
        if slept <= SHORT_WAKE {
            tracing::info!(?slept, "Short wake detected, probing sampled nodes");
            let sample: Vec<SocketAddr> = self
                .routing
                .closest(&id::random_id(self.entropy.as_ref()), 8)
                .into_iter()
                .map(|n| n.addr)
                .collect();
            for addr in sample {
                self.send_ping(addr, false, now);
            }
        } else {
            tracing::info!(?slept, "Long wake detected, probing and re-bootstrapping");
            let sample: Vec<SocketAddr> = self
                .routing
                .closest(&id::random_id(self.entropy.as_ref()), 16)
                .into_iter()
                .map(|n| n.addr)
                .collect();
            for addr in sample {
                self.send_ping(addr, true, now);
            }
            if !self.rebootstrapping {
                self.rebootstrapping = true;
                // merge public seeds with the survivors
                self.bootstrap(now);
            }
        }
    }

    /// Snapshot for `session:dht:state`; failure counters are not kept
    pub fn to_persisted(&self) -> PersistedDht {
        PersistedDht {
            node_id_hex: hex::encode(self.node_id),
            nodes: self
                .routing
                .nodes()
                .map(|n| PersistedNode {
                    id: hex::encode(n.id),
                    host: n.addr.ip().to_string(),
                    port: n.addr.port(),
                })
                .collect(),
        }
    }

    /// Rebuild the routing table from a persisted snapshot
    pub fn restore(&mut self, persisted: &PersistedDht, now: Duration) {
        for node in &persisted.nodes {
            let Ok(id_bytes) = hex::decode(&node.id) else {
                continue;
            };
            let Ok(node_id): Result<NodeId, _> = id_bytes[..].try_into() else {
                continue;
            };
            let Ok(ip) = node.host.parse::<std::net::IpAddr>() else {
                continue;
            };
            self.routing
                .add(node_id, SocketAddr::new(ip, node.port), now);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use bytes::Bytes;

    use crate::caps::memory::{MemoryNet, SeededEntropy};
    use crate::caps::SocketFactory;

    use super::krpc::{
        decode_compact_nodes, DhtQuery, DhtResponse, GetPeersValues, KrpcMessage, KrpcPayload,
    };
    use super::*;

    const NOW: Duration = Duration::from_secs(100);

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:6881").parse().unwrap()
    }

    async fn test_dht(bootstrap: Vec<SocketAddr>) -> (Dht, MemoryNet) {
        let net = MemoryNet::new();
        let (datagram_tx, datagram_rx) = flume::unbounded();
        let socket = net.bind_udp(6881, datagram_tx).await.unwrap();
        let dht = Dht::new(
            [0x11; 20],
            socket,
            datagram_rx,
            Arc::new(SeededEntropy::new(77)),
            bootstrap,
            6885,
            NOW,
            1_000_000,
        );
        (dht, net)
    }

    fn parse_sent(net: &MemoryNet) -> Vec<(SocketAddr, KrpcMessage)> {
        net.take_udp_sent()
            .into_iter()
            .map(|(to, bytes)| (to, KrpcMessage::from_bytes(&bytes).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn server_answers_ping() {
        let (mut dht, net) = test_dht(vec![]).await;
        let ping = KrpcMessage::query(
            Bytes::from_static(b"xy"),
            "ping",
            DhtQuery::Ping {
                id: Bytes::copy_from_slice(&[0x22; 20]),
            },
        );
        net.push_datagram(addr(5), ping.to_bytes());
        dht.tick(NOW, 1_000_000);

        let sent = parse_sent(&net);
        assert_eq!(sent.len(), 1);
        let (to, reply) = &sent[0];
        assert_eq!(*to, addr(5));
        assert_eq!(&reply.transaction_id[..], b"xy");
        assert!(matches!(
            &reply.payload,
            KrpcPayload::Response {
                response: DhtResponse::PingOrAnnounce { .. }
            }
        ));
        // the caller made it into the routing table
        assert_eq!(dht.routing_nodes(), 1);
    }

    #[tokio::test]
    async fn get_peers_returns_token_and_nodes_then_accepts_announce() {
        let (mut dht, net) = test_dht(vec![]).await;
        // seed the table with one node so get_peers has nodes to return
        dht.routing.add([0x33; 20], addr(9), NOW);

        let get_peers = KrpcMessage::query(
            Bytes::from_static(b"gp"),
            "get_peers",
            DhtQuery::GetPeers {
                id: Bytes::copy_from_slice(&[0x22; 20]),
                info_hash: Bytes::copy_from_slice(&[0xab; 20]),
            },
        );
        net.push_datagram(addr(5), get_peers.to_bytes());
        dht.tick(NOW, 1_000_000);

        let sent = parse_sent(&net);
        let (_, reply) = &sent[0];
        let KrpcPayload::Response {
            response:
                DhtResponse::GetPeers {
                    token,
                    values: GetPeersValues::Nodes(nodes),
                    ..
                },
        } = &reply.payload
        else {
            panic!("expected get_peers response with nodes, got {reply:?}");
        };
        let decoded = decode_compact_nodes(nodes);
        assert!(decoded.iter().any(|(_, a)| *a == addr(9)));

        // announcing with that token stores the peer
        let announce = KrpcMessage::query(
            Bytes::from_static(b"an"),
            "announce_peer",
            DhtQuery::AnnouncePeer {
                id: Bytes::copy_from_slice(&[0x22; 20]),
                implied_port: Some(0),
                info_hash: Bytes::copy_from_slice(&[0xab; 20]),
                port: 7777,
                token: token.clone(),
            },
        );
        net.push_datagram(addr(5), announce.to_bytes());
        dht.tick(NOW, 1_000_000);
        let mut stored_addr = addr(5);
        stored_addr.set_port(7777);
        assert_eq!(dht.peer_store.get(&[0xab; 20]), vec![stored_addr]);

        // now a second get_peers returns values instead of nodes
        let get_peers = KrpcMessage::query(
            Bytes::from_static(b"g2"),
            "get_peers",
            DhtQuery::GetPeers {
                id: Bytes::copy_from_slice(&[0x44; 20]),
                info_hash: Bytes::copy_from_slice(&[0xab; 20]),
            },
        );
        net.push_datagram(addr(6), get_peers.to_bytes());
        dht.tick(NOW, 1_000_000);
        let sent = parse_sent(&net);
        let with_values = sent.iter().any(|(_, m)| {
            matches!(
                &m.payload,
                KrpcPayload::Response {
                    response: DhtResponse::GetPeers {
                        values: GetPeersValues::Values(_),
                        ..
                    }
                }
            )
        });
        assert!(with_values);
    }

    #[tokio::test]
    async fn announce_with_bad_token_is_rejected() {
        let (mut dht, net) = test_dht(vec![]).await;
        let announce = KrpcMessage::query(
            Bytes::from_static(b"an"),
            "announce_peer",
            DhtQuery::AnnouncePeer {
                id: Bytes::copy_from_slice(&[0x22; 20]),
                implied_port: None,
                info_hash: Bytes::copy_from_slice(&[0xab; 20]),
                port: 7777,
                token: Bytes::from_static(b"forged token bytes!!"),
            },
        );
        net.push_datagram(addr(5), announce.to_bytes());
        dht.tick(NOW, 1_000_000);

        let sent = parse_sent(&net);
        let (_, reply) = &sent[0];
        let KrpcPayload::Error { error: (code, _) } = &reply.payload else {
            panic!("expected error reply, got {reply:?}");
        };
        assert_eq!(*code, super::krpc::ERROR_PROTOCOL);
        assert!(dht.peer_store.get(&[0xab; 20]).is_empty());
    }

    #[tokio::test]
    async fn bootstrap_queries_seed_hosts() {
        let (mut dht, net) = test_dht(vec![addr(1), addr(2)]).await;
        dht.bootstrap(NOW);
        let sent = parse_sent(&net);
        assert_eq!(sent.len(), 2);
        for (_, message) in &sent {
            let KrpcPayload::Query { method, .. } = &message.payload else {
                panic!("expected query");
            };
            assert_eq!(method, "find_node");
        }

        // a seed answers with closer nodes; the lookup keeps walking
        let (to, message) = &sent[0];
        let closer = super::krpc::encode_compact_nodes(&[([0x12; 20], addr(30))]);
        let reply = KrpcMessage::response(
            message.transaction_id.clone(),
            DhtResponse::FindNode {
                id: Bytes::copy_from_slice(&[0x55; 20]),
                nodes: closer,
            },
        );
        net.push_datagram(*to, reply.to_bytes());
        dht.tick(NOW + Duration::from_secs(1), 1_001_000);
        // responder and the returned node are both known now
        assert!(dht.routing_nodes() >= 1);
        let followups = parse_sent(&net);
        assert!(followups.iter().any(|(to, _)| *to == addr(30)));
    }

    #[tokio::test]
    async fn lookup_timeouts_feed_staleness_and_finish() {
        let (mut dht, net) = test_dht(vec![addr(1), addr(2), addr(3)]).await;
        dht.find_peers([0xcd; 20], None, NOW);
        // no nodes known: lookup starts empty and finishes silently
        dht.tick(NOW, 1_000_000);
        assert!(dht.lookups.is_empty());
        assert!(dht.take_events().is_empty());

        // bootstrap then let every query time out
        dht.bootstrap(NOW);
        assert_eq!(parse_sent(&net).len(), 3);
        dht.tick(NOW + Duration::from_secs(6), 1_006_000);
        // all three timed out; lookup has nothing left and finishes
        dht.tick(NOW + Duration::from_secs(7), 1_007_000);
        assert!(dht.lookups.is_empty());
        let events = dht.take_events();
        assert!(matches!(
            events[..],
            [DhtEvent::Bootstrapped { routing_nodes: 0 }]
        ));
    }

    #[tokio::test]
    async fn announce_after_lookup_reports_success_ratio() {
        let (mut dht, net) = test_dht(vec![]).await;
        dht.routing.add([0x33; 20], addr(9), NOW);
        dht.find_peers([0xab; 20], Some(6885), NOW);

        // the queried node responds with peers and a token
        let sent = parse_sent(&net);
        let (_, query) = &sent[0];
        let reply = KrpcMessage::response(
            query.transaction_id.clone(),
            DhtResponse::GetPeers {
                id: Bytes::copy_from_slice(&[0x33; 20]),
                token: Bytes::from_static(b"tokentoken"),
                values: GetPeersValues::Values(vec![Bytes::from_static(&[10, 0, 0, 7, 0x1a, 0xe1])]),
            },
        );
        net.push_datagram(addr(9), reply.to_bytes());
        dht.tick(NOW + Duration::from_secs(1), 1_001_000);
        // lookup converged; announce goes out to the token holder
        dht.tick(NOW + Duration::from_secs(2), 1_002_000);

        let events = dht.take_events();
        assert!(matches!(
            events[..],
            [DhtEvent::PeersFound { ref peers, .. }] if peers.len() == 1
        ));

        let announces = parse_sent(&net);
        let announce = announces.iter().find_map(|(to, m)| {
            if let KrpcPayload::Query { method, arguments } = &m.payload {
                (method == "announce_peer").then_some((to, arguments, m.transaction_id.clone()))
            } else {
                None
            }
        });
        let (to, arguments, tid) = announce.expect("announce_peer was sent");
        assert_eq!(*to, addr(9));
        let DhtQuery::AnnouncePeer { token, port, .. } = arguments else {
            panic!("expected announce arguments");
        };
        assert_eq!(&token[..], b"tokentoken");
        assert_eq!(*port, 6885);

        // the node acks; the announce event reports 1/1
        let ack = KrpcMessage::response(
            tid,
            DhtResponse::PingOrAnnounce {
                id: Bytes::copy_from_slice(&[0x33; 20]),
            },
        );
        net.push_datagram(addr(9), ack.to_bytes());
        dht.tick(NOW + Duration::from_secs(3), 1_003_000);
        let events = dht.take_events();
        assert!(matches!(
            events[..],
            [DhtEvent::Announced {
                succeeded: 1,
                total: 1,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn wake_detection_probes_nodes() {
        let (mut dht, net) = test_dht(vec![addr(1)]).await;
        for i in 0..4u8 {
            dht.routing.add([0x30 + i; 20], addr(10 + i), NOW);
        }
        parse_sent(&net);

        // wall clock jumps 5 minutes while monotonic moves 1 second
        dht.tick(NOW + Duration::from_secs(1), 1_000_000 + 5 * 60 * 1000);
        let sent = parse_sent(&net);
        // short wake: sampled nodes get pinged, no re-bootstrap
        assert!(!sent.is_empty());
        for (_, message) in &sent {
            let KrpcPayload::Query { method, .. } = &message.payload else {
                panic!("expected query");
            };
            assert_eq!(method, "ping");
        }
        assert!(!dht.rebootstrapping);

        // a jump over 15 minutes triggers the full re-bootstrap
        dht.tick(NOW + Duration::from_secs(2), 1_000_000 + 60 * 60 * 1000);
        assert!(dht.rebootstrapping);
        let sent = parse_sent(&net);
        assert!(sent
            .iter()
            .any(|(_, m)| matches!(&m.payload, KrpcPayload::Query { method, .. } if method == "find_node")));
    }

    #[tokio::test]
    async fn persistence_round_trip_preserves_nodes() {
        let (mut dht, _net) = test_dht(vec![]).await;
        dht.routing.add([0x33; 20], addr(9), NOW);
        dht.routing.add([0x44; 20], addr(10), NOW);
        let persisted = dht.to_persisted();
        assert_eq!(persisted.node_id_hex, hex::encode([0x11; 20]));
        assert_eq!(persisted.nodes.len(), 2);

        let (mut restored, _net2) = test_dht(vec![]).await;
        restored.restore(&persisted, NOW);
        assert_eq!(restored.routing_nodes(), 2);
        let mut original: Vec<_> = persisted
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.host.clone(), n.port))
            .collect();
        let restored_state = restored.to_persisted();
        let mut round_tripped: Vec<_> = restored_state
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.host.clone(), n.port))
            .collect();
        original.sort();
        round_tripped.sort();
        assert_eq!(original, round_tripped);
    }
}
