//! Deterministic in-memory capability providers used by tests. Transport,
//! filesystem, session store, clock and entropy are all scriptable so the
//! engine can be stepped tick by tick with exact outcomes.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    Clock, ConnId, Entropy, FileStat, FileSystem, SessionStore, SocketFactory, TcpLink,
    TransportEvent, UdpChannel,
};

#[derive(Debug, Default)]
struct NetState {
    next_conn: ConnId,
    dials: Vec<PendingDial>,
    listeners: Vec<flume::Sender<TransportEvent>>,
    udp_inbound: Vec<flume::Sender<(SocketAddr, Bytes)>>,
    udp_sent: Vec<(SocketAddr, Bytes)>,
    backpressure: bool,
}

#[derive(Debug)]
struct PendingDial {
    conn: ConnId,
    addr: SocketAddr,
    events: flume::Sender<TransportEvent>,
}

/// Scriptable socket factory: dials park until the test resolves them,
/// accepted links and datagrams are injected by hand.
#[derive(Debug, Clone, Default)]
pub struct MemoryNet {
    state: Arc<Mutex<NetState>>,
}

/// Test side of one in-memory link: outbound bytes pile up for
/// inspection, inbound bytes are pushed as transport events.
#[derive(Debug, Clone)]
pub struct MemoryLinkHandle {
    pub conn: ConnId,
    outbound: Arc<Mutex<Vec<Bytes>>>,
    closed: Arc<Mutex<bool>>,
    events: flume::Sender<TransportEvent>,
}

impl MemoryLinkHandle {
    /// Drain everything the engine wrote to this link
    pub fn take_outbound(&self) -> Vec<u8> {
        let mut chunks = self.outbound.lock().unwrap();
        let mut out = Vec::new();
        for chunk in chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        out
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    pub fn push_data(&self, data: impl Into<Bytes>) {
        let _ = self.events.send(TransportEvent::Data {
            conn: self.conn,
            data: data.into(),
        });
    }

    pub fn push_closed(&self, error: Option<&str>) {
        let _ = self.events.send(TransportEvent::Closed {
            conn: self.conn,
            error: error.map(Into::into),
        });
    }
}

#[derive(Debug)]
struct MemoryLink {
    outbound: Arc<Mutex<Vec<Bytes>>>,
    closed: Arc<Mutex<bool>>,
}

impl TcpLink for MemoryLink {
    fn send(&mut self, data: Bytes) {
        self.outbound.lock().unwrap().push(data);
    }

    fn close(&mut self) {
        *self.closed.lock().unwrap() = true;
    }

    fn set_paused(&mut self, _paused: bool) {}
}

impl MemoryNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses the engine is currently dialing
    pub fn pending_dials(&self) -> Vec<(ConnId, SocketAddr)> {
        let state = self.state.lock().unwrap();
        state.dials.iter().map(|d| (d.conn, d.addr)).collect()
    }

    fn new_link(
        conn: ConnId,
        events: flume::Sender<TransportEvent>,
    ) -> (MemoryLink, MemoryLinkHandle) {
        let outbound = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let link = MemoryLink {
            outbound: outbound.clone(),
            closed: closed.clone(),
        };
        let handle = MemoryLinkHandle {
            conn,
            outbound,
            closed,
            events,
        };
        (link, handle)
    }

    /// Resolve a pending dial successfully
    pub fn complete_dial(&self, conn: ConnId) -> MemoryLinkHandle {
        let mut state = self.state.lock().unwrap();
        let position = state
            .dials
            .iter()
            .position(|d| d.conn == conn)
            .expect("dial is pending");
        let dial = state.dials.remove(position);
        let (link, handle) = Self::new_link(conn, dial.events.clone());
        let _ = dial.events.send(TransportEvent::Connected {
            conn,
            link: Box::new(link),
        });
        handle
    }

    /// Resolve a pending dial with a connection failure
    pub fn fail_dial(&self, conn: ConnId, error: &str) {
        let mut state = self.state.lock().unwrap();
        let position = state
            .dials
            .iter()
            .position(|d| d.conn == conn)
            .expect("dial is pending");
        let dial = state.dials.remove(position);
        let _ = dial.events.send(TransportEvent::Closed {
            conn,
            error: Some(error.into()),
        });
    }

    /// Simulate a remote peer connecting to our listener
    pub fn push_accepted(&self, addr: SocketAddr) -> MemoryLinkHandle {
        let mut state = self.state.lock().unwrap();
        state.next_conn += 1;
        let conn = state.next_conn;
        let events = state
            .listeners
            .last()
            .expect("listener is bound")
            .clone();
        let (link, handle) = Self::new_link(conn, events.clone());
        let _ = events.send(TransportEvent::Accepted {
            conn,
            link: Box::new(link),
            addr,
        });
        handle
    }

    /// Datagrams the engine sent through any bound udp socket
    pub fn take_udp_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut self.state.lock().unwrap().udp_sent)
    }

    /// Deliver a datagram to the most recently bound udp socket
    pub fn push_datagram(&self, from: SocketAddr, data: impl Into<Bytes>) {
        let state = self.state.lock().unwrap();
        if let Some(inbound) = state.udp_inbound.last() {
            let _ = inbound.send((from, data.into()));
        }
    }

    pub fn backpressure_active(&self) -> bool {
        self.state.lock().unwrap().backpressure
    }
}

#[async_trait]
impl SocketFactory for MemoryNet {
    fn connect_tcp(&self, addr: SocketAddr, events: flume::Sender<TransportEvent>) -> ConnId {
        let mut state = self.state.lock().unwrap();
        state.next_conn += 1;
        let conn = state.next_conn;
        state.dials.push(PendingDial { conn, addr, events });
        conn
    }

    async fn listen_tcp(
        &self,
        port: u16,
        events: flume::Sender<TransportEvent>,
    ) -> io::Result<u16> {
        let mut state = self.state.lock().unwrap();
        state.listeners.push(events);
        Ok(if port == 0 { 6881 } else { port })
    }

    async fn bind_udp(
        &self,
        port: u16,
        datagrams: flume::Sender<(SocketAddr, Bytes)>,
    ) -> io::Result<Box<dyn UdpChannel>> {
        let mut state = self.state.lock().unwrap();
        state.udp_inbound.push(datagrams);
        Ok(Box::new(MemoryUdp {
            sent: Arc::clone(&self.state),
            local_port: if port == 0 { 6881 } else { port },
        }))
    }

    fn set_backpressure(&self, active: bool) {
        self.state.lock().unwrap().backpressure = active;
    }
}

#[derive(Debug)]
struct MemoryUdp {
    sent: Arc<Mutex<NetState>>,
    local_port: u16,
}

impl UdpChannel for MemoryUdp {
    fn send_to(&self, addr: SocketAddr, data: Bytes) {
        self.sent.lock().unwrap().udp_sent.push((addr, data));
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryFileSystem {
    files: Arc<Mutex<HashMap<(String, PathBuf), Vec<u8>>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self, root: &str, path: &Path) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&(root.to_owned(), path.to_owned()))
            .cloned()
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    async fn write_at(
        &self,
        root: &str,
        path: &Path,
        offset: u64,
        data: &[u8],
    ) -> io::Result<u64> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .entry((root.to_owned(), path.to_owned()))
            .or_default();
        let end = offset as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(data);
        Ok(data.len() as u64)
    }

    async fn read_at(
        &self,
        root: &str,
        path: &Path,
        offset: u64,
        length: usize,
    ) -> io::Result<Bytes> {
        let files = self.files.lock().unwrap();
        let file = files
            .get(&(root.to_owned(), path.to_owned()))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))?;
        let start = offset as usize;
        let end = start + length;
        if end > file.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of file",
            ));
        }
        Ok(Bytes::copy_from_slice(&file[start..end]))
    }

    async fn set_len(&self, root: &str, path: &Path, length: u64) -> io::Result<()> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .entry((root.to_owned(), path.to_owned()))
            .or_default();
        file.resize(length as usize, 0);
        Ok(())
    }

    async fn stat(&self, root: &str, path: &Path) -> io::Result<FileStat> {
        let files = self.files.lock().unwrap();
        let file = files
            .get(&(root.to_owned(), path.to_owned()))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))?;
        Ok(FileStat {
            size: file.len() as u64,
            is_file: true,
        })
    }

    async fn exists(&self, root: &str, path: &Path) -> bool {
        self.files
            .lock()
            .unwrap()
            .contains_key(&(root.to_owned(), path.to_owned()))
    }

    async fn remove(&self, root: &str, path: &Path) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(&(root.to_owned(), path.to_owned()));
        Ok(())
    }

    async fn sync(&self, _root: &str, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    async fn set(&self, key: &str, value: Bytes) {
        self.entries.lock().unwrap().insert(key.to_owned(), value);
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    async fn keys(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

/// Clock whose wall and monotonic components move only when told to.
/// `jump_wall` moves wall time alone, which is how sleep/wake looks to
/// the dht maintenance.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<(u64, Duration)>>,
}

impl ManualClock {
    pub fn new(start_unix_ms: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new((start_unix_ms, Duration::ZERO))),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap();
        state.0 += by.as_millis() as u64;
        state.1 += by;
    }

    /// Move only the wall clock forward, as if the host slept
    pub fn jump_wall(&self, by: Duration) {
        let mut state = self.state.lock().unwrap();
        state.0 += by.as_millis() as u64;
    }
}

impl Clock for ManualClock {
    fn now_unix_ms(&self) -> u64 {
        self.state.lock().unwrap().0
    }

    fn monotonic(&self) -> Duration {
        self.state.lock().unwrap().1
    }
}

/// Xorshift based deterministic entropy
#[derive(Debug)]
pub struct SeededEntropy {
    state: Mutex<u64>,
}

impl SeededEntropy {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(seed.max(1)),
        }
    }
}

impl Entropy for SeededEntropy {
    fn fill(&self, buf: &mut [u8]) {
        let mut state = self.state.lock().unwrap();
        for chunk in buf.chunks_mut(8) {
            let mut x = *state;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            *state = x;
            let bytes = x.to_be_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_unix_ms(), 1_000);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now_unix_ms(), 6_000);
        assert_eq!(clock.monotonic(), Duration::from_secs(5));
        clock.jump_wall(Duration::from_secs(60));
        assert_eq!(clock.now_unix_ms(), 66_000);
        assert_eq!(clock.monotonic(), Duration::from_secs(5));
    }

    #[test]
    fn seeded_entropy_is_reproducible() {
        let a = SeededEntropy::new(42);
        let b = SeededEntropy::new(42);
        let mut buf_a = [0u8; 32];
        let mut buf_b = [0u8; 32];
        a.fill(&mut buf_a);
        b.fill(&mut buf_b);
        assert_eq!(buf_a, buf_b);
        let mut buf_c = [0u8; 32];
        a.fill(&mut buf_c);
        assert_ne!(buf_a, buf_c);
    }

    #[tokio::test]
    async fn session_store_prefix_listing() {
        let store = MemorySessionStore::new();
        store.set("session:torrents", Bytes::from_static(b"[]")).await;
        store
            .set("session:config:port", Bytes::from_static(b"6881"))
            .await;
        store
            .set("session:config:dht", Bytes::from_static(b"true"))
            .await;
        let keys = store.keys("session:config:").await;
        assert_eq!(keys, ["session:config:dht", "session:config:port"]);
        store.delete("session:config:dht").await;
        assert_eq!(store.keys("session:config:").await.len(), 1);
    }
}
