use std::{
    collections::HashMap,
    net::SocketAddr,
    time::Duration,
};

use bytes::Bytes;

use super::id::NodeId;

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a query was sent; routes the response to the right consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPurpose {
    /// Liveness probe, possibly on behalf of a full bucket. Strict
    /// probes evict on the first failure (long-wake recovery).
    Ping { strict: bool },
    /// Bucket refresh or bootstrap step driven by a lookup id
    Lookup { lookup: u64 },
    /// Announce after a finished lookup
    Announce { info_hash: NodeId },
}

#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub tid: u16,
    pub addr: SocketAddr,
    pub purpose: QueryPurpose,
    pub sent_at: Duration,
}

/// Tracks in-flight krpc queries by their two byte transaction id.
/// Ids advance monotonically and wrap.
#[derive(Debug, Default)]
pub struct TransactionManager {
    next_tid: u16,
    pending: HashMap<u16, PendingQuery>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_amount(&self) -> usize {
        self.pending.len()
    }

    /// Register a new outgoing query and get its wire transaction id
    pub fn issue(&mut self, addr: SocketAddr, purpose: QueryPurpose, now: Duration) -> Bytes {
        // skip ids that are still in flight, the space is 65536 wide
        let mut tid = self.next_tid;
        while self.pending.contains_key(&tid) {
            tid = tid.wrapping_add(1);
        }
        self.next_tid = tid.wrapping_add(1);
        self.pending.insert(
            tid,
            PendingQuery {
                tid,
                addr,
                purpose,
                sent_at: now,
            },
        );
        Bytes::copy_from_slice(&tid.to_be_bytes())
    }

    /// Match a response to its query. The source address must agree so a
    /// third party cannot answer for someone else.
    pub fn resolve(&mut self, transaction_id: &[u8], from: SocketAddr) -> Option<PendingQuery> {
        let tid = u16::from_be_bytes(transaction_id.try_into().ok()?);
        let entry = self.pending.get(&tid)?;
        if entry.addr != from {
            tracing::debug!(%from, expected = %entry.addr, "Response from unexpected address");
            return None;
        }
        self.pending.remove(&tid)
    }

    /// Collect queries that waited longer than the timeout
    pub fn reap_timed_out(&mut self, now: Duration) -> Vec<PendingQuery> {
        let timed_out: Vec<u16> = self
            .pending
            .values()
            .filter(|q| now.saturating_sub(q.sent_at) >= QUERY_TIMEOUT)
            .map(|q| q.tid)
            .collect();
        timed_out
            .into_iter()
            .filter_map(|tid| self.pending.remove(&tid))
            .collect()
    }

    /// Drop everything, e.g. when the socket goes away
    pub fn clear(&mut self) -> Vec<PendingQuery> {
        self.pending.drain().map(|(_, q)| q).collect()
    }
}
