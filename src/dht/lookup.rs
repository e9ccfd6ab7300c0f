use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
};

use bytes::Bytes;

use super::{
    id::{cmp_distance, NodeId},
    routing::{DhtNode, ALPHA, K},
};

/// Iterative lookup over the xor metric (`get_peers` or `find_node`).
/// Candidates only ever grow, queried addresses never repeat, and the
/// walk stops when the closest responders crowd out every remaining
/// candidate.
#[derive(Debug)]
pub struct Lookup {
    pub target: NodeId,
    /// Unqueried candidates sorted closest first
    candidates: Vec<(NodeId, SocketAddr)>,
    known: HashSet<SocketAddr>,
    queried: HashSet<SocketAddr>,
    /// Nodes that answered, sorted closest first
    responded: Vec<(NodeId, SocketAddr)>,
    tokens: HashMap<SocketAddr, Bytes>,
    peers: Vec<SocketAddr>,
    seen_peers: HashSet<SocketAddr>,
    inflight: usize,
}

#[derive(Debug)]
pub struct LookupResult {
    pub target: NodeId,
    /// Unique peers accumulated from every response
    pub peers: Vec<SocketAddr>,
    /// The k closest nodes that responded
    pub closest: Vec<(NodeId, SocketAddr)>,
    /// Announce tokens by node address
    pub tokens: HashMap<SocketAddr, Bytes>,
}

impl Lookup {
    pub fn new(target: NodeId, seeds: Vec<DhtNode>) -> Self {
        let mut this = Self {
            target,
            candidates: Vec::new(),
            known: HashSet::new(),
            queried: HashSet::new(),
            responded: Vec::new(),
            tokens: HashMap::new(),
            peers: Vec::new(),
            seen_peers: HashSet::new(),
            inflight: 0,
        };
        for seed in seeds {
            this.add_candidate(seed.id, seed.addr);
        }
        this
    }

    fn add_candidate(&mut self, id: NodeId, addr: SocketAddr) {
        if !self.known.insert(addr) {
            return;
        }
        let position = self
            .candidates
            .partition_point(|(candidate, _)| {
                cmp_distance(&self.target, candidate, &id) == std::cmp::Ordering::Less
            });
        self.candidates.insert(position, (id, addr));
    }

    /// Addresses to query next, keeping at most ALPHA in flight
    pub fn next_queries(&mut self) -> Vec<(NodeId, SocketAddr)> {
        let mut queries = Vec::new();
        while self.inflight + queries.len() < ALPHA {
            let Some(position) = self
                .candidates
                .iter()
                .position(|(_, addr)| !self.queried.contains(addr))
            else {
                break;
            };
            let (id, addr) = self.candidates.remove(position);
            self.queried.insert(addr);
            queries.push((id, addr));
        }
        self.inflight += queries.len();
        queries
    }

    pub fn on_response(
        &mut self,
        from_id: NodeId,
        from: SocketAddr,
        closer_nodes: Vec<(NodeId, SocketAddr)>,
        peers: Vec<SocketAddr>,
        token: Option<Bytes>,
    ) {
        self.inflight = self.inflight.saturating_sub(1);
        let position = self.responded.partition_point(|(id, _)| {
            cmp_distance(&self.target, id, &from_id) == std::cmp::Ordering::Less
        });
        self.responded.insert(position, (from_id, from));
        if let Some(token) = token {
            self.tokens.insert(from, token);
        }
        for peer in peers {
            if self.seen_peers.insert(peer) {
                self.peers.push(peer);
            }
        }
        for (id, addr) in closer_nodes {
            if !self.queried.contains(&addr) {
                self.add_candidate(id, addr);
            }
        }
    }

    pub fn on_failure(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
    }

    /// Converged when the k closest responders are all at least as close
    /// as any unqueried candidate, or there is nothing left to ask
    pub fn is_converged(&self) -> bool {
        if self.inflight > 0 {
            return false;
        }
        let next_candidate = self
            .candidates
            .iter()
            .find(|(_, addr)| !self.queried.contains(addr));
        let Some((closest_candidate, _)) = next_candidate else {
            return true;
        };
        if self.responded.len() < K {
            return false;
        }
        let (kth_closest, _) = &self.responded[K - 1];
        cmp_distance(&self.target, kth_closest, closest_candidate) != std::cmp::Ordering::Greater
    }

    pub fn finish(mut self) -> LookupResult {
        self.responded.truncate(K);
        LookupResult {
            target: self.target,
            peers: self.peers,
            closest: self.responded,
            tokens: self.tokens,
        }
    }
}
