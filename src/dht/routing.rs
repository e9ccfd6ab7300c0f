use std::{net::SocketAddr, time::Duration};

use super::id::{cmp_distance, NodeId};

pub const K: usize = 8;
pub const ALPHA: usize = 3;
/// Consecutive failed queries before a node is evicted
pub const MAX_NODE_FAILURES: u32 = 2;

#[derive(Debug, Clone)]
pub struct DhtNode {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Duration,
    pub failures: u32,
}

impl DhtNode {
    pub fn new(id: NodeId, addr: SocketAddr, now: Duration) -> Self {
        Self {
            id,
            addr,
            last_seen: now,
            failures: 0,
        }
    }
}

/// One aligned slice of the id space: `[min, min | mask]`. Nodes are
/// kept oldest first; the most recently seen node sits at the tail.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub min: NodeId,
    /// Low bits covered by this bucket; the span is `mask + 1`
    pub mask: NodeId,
    pub nodes: Vec<DhtNode>,
    pub last_changed: Duration,
}

impl Bucket {
    fn whole_space(now: Duration) -> Self {
        Self {
            min: [0; 20],
            mask: [0xff; 20],
            nodes: Vec::with_capacity(K),
            last_changed: now,
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        for i in 0..20 {
            if id[i] & !self.mask[i] != self.min[i] {
                return false;
            }
        }
        true
    }

    /// Split into the lower and upper half of the range
    fn split(self) -> (Bucket, Bucket) {
        // shifting the mask right by one drops the top covered bit
        let mut half_mask = [0u8; 20];
        let mut carry = 0u8;
        for i in 0..20 {
            half_mask[i] = (self.mask[i] >> 1) | carry;
            carry = (self.mask[i] & 1) << 7;
        }
        // the dropped bit is the upper half's offset
        let mut upper_min = self.min;
        for i in 0..20 {
            upper_min[i] |= self.mask[i] ^ half_mask[i];
        }

        let mut lower = Bucket {
            min: self.min,
            mask: half_mask,
            nodes: Vec::with_capacity(K),
            last_changed: self.last_changed,
        };
        let mut upper = Bucket {
            min: upper_min,
            mask: half_mask,
            nodes: Vec::with_capacity(K),
            last_changed: self.last_changed,
        };
        for node in self.nodes {
            if lower.contains(&node.id) {
                lower.nodes.push(node);
            } else {
                debug_assert!(upper.contains(&node.id));
                upper.nodes.push(node);
            }
        }
        (lower, upper)
    }
}

/// What `add` decided to do with a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Node was known; moved to the tail with its failures reset
    Refreshed,
    /// Bucket is full and cannot split; the caller should ping the
    /// least recently seen node and retry after it is evicted
    Full { ping: SocketAddr },
    /// Our own id is never stored
    Ignored,
}

/// Binary trie of k-buckets over the 160 bit id space, flattened into a
/// sorted bucket list. Only the bucket covering our own id splits.
#[derive(Debug)]
pub struct RoutingTable {
    node_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(node_id: NodeId, now: Duration) -> Self {
        Self {
            node_id,
            buckets: vec![Bucket::whole_space(now)],
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DhtNode> {
        self.buckets.iter().flat_map(|b| b.nodes.iter())
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.contains(id))
            .expect("buckets cover the whole id space")
    }

    pub fn add(&mut self, id: NodeId, addr: SocketAddr, now: Duration) -> AddOutcome {
        if id == self.node_id {
            return AddOutcome::Ignored;
        }
        loop {
            let index = self.bucket_index(&id);
            let covers_own = self.buckets[index].contains(&self.node_id);
            let bucket = &mut self.buckets[index];

            if let Some(position) = bucket.nodes.iter().position(|n| n.id == id) {
                let mut node = bucket.nodes.remove(position);
                node.failures = 0;
                node.last_seen = now;
                node.addr = addr;
                bucket.nodes.push(node);
                bucket.last_changed = now;
                return AddOutcome::Refreshed;
            }

            if bucket.nodes.len() < K {
                bucket.nodes.push(DhtNode::new(id, addr, now));
                bucket.last_changed = now;
                return AddOutcome::Added;
            }

            if covers_own {
                // splits happen before any ping is asked for
                let bucket = self.buckets.remove(index);
                let (lower, upper) = bucket.split();
                self.buckets.insert(index, upper);
                self.buckets.insert(index, lower);
                continue;
            }

            let lru = bucket.nodes.first().expect("full bucket has nodes");
            return AddOutcome::Full { ping: lru.addr };
        }
    }

    /// The `n` known nodes closest to `target` by xor distance
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<DhtNode> {
        let mut nodes: Vec<DhtNode> = self.nodes().cloned().collect();
        nodes.sort_by(|a, b| cmp_distance(target, &a.id, &b.id));
        nodes.truncate(n);
        nodes
    }

    pub fn find(&self, id: &NodeId) -> Option<&DhtNode> {
        let index = self.bucket_index(id);
        self.buckets[index].nodes.iter().find(|n| n.id == *id)
    }

    /// Count one failed query against the node at `addr`. Evicts after
    /// the failure threshold and reports whether it did.
    pub fn record_failure(&mut self, addr: SocketAddr) -> bool {
        for bucket in &mut self.buckets {
            if let Some(position) = bucket.nodes.iter().position(|n| n.addr == addr) {
                bucket.nodes[position].failures += 1;
                if bucket.nodes[position].failures >= MAX_NODE_FAILURES {
                    bucket.nodes.remove(position);
                    return true;
                }
                return false;
            }
        }
        false
    }

    pub fn remove(&mut self, addr: SocketAddr) {
        for bucket in &mut self.buckets {
            bucket.nodes.retain(|n| n.addr != addr);
        }
    }

    pub fn mark_responded(&mut self, addr: SocketAddr, now: Duration) {
        for bucket in &mut self.buckets {
            if let Some(position) = bucket.nodes.iter().position(|n| n.addr == addr) {
                let mut node = bucket.nodes.remove(position);
                node.failures = 0;
                node.last_seen = now;
                bucket.nodes.push(node);
                bucket.last_changed = now;
                return;
            }
        }
    }

    /// Ranges of buckets that have not changed for `max_age`, for
    /// periodic refresh lookups
    pub fn stale_buckets(&self, now: Duration, max_age: Duration) -> Vec<(NodeId, NodeId)> {
        self.buckets
            .iter()
            .filter(|b| now.saturating_sub(b.last_changed) > max_age)
            .map(|b| (b.min, b.mask))
            .collect()
    }

    pub fn touch_bucket(&mut self, id: &NodeId, now: Duration) {
        let index = self.bucket_index(id);
        self.buckets[index].last_changed = now;
    }
}
