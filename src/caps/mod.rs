use std::{io, net::SocketAddr, path::Path, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

pub mod local_fs;
pub mod memory;
pub mod tokio_net;

/// Engine-wide identifier of a tcp link. Allocated by the socket factory,
/// unique for the factory's lifetime.
pub type ConnId = u64;

/// Opaque storage root key, hex of sha1(salt + real path)
pub type RootKey = String;

/// Everything transport providers push back into the engine. The engine
/// drains these at the start of every tick; providers never call into
/// engine state directly.
#[derive(Debug)]
pub enum TransportEvent {
    /// Outgoing dial finished, link is ready for traffic
    Connected { conn: ConnId, link: Box<dyn TcpLink> },
    /// Remote end accepted by our listener
    Accepted {
        conn: ConnId,
        link: Box<dyn TcpLink>,
        addr: SocketAddr,
    },
    Data { conn: ConnId, data: Bytes },
    /// Connection is gone. Dial failures arrive as this without a
    /// preceding [TransportEvent::Connected].
    Closed { conn: ConnId, error: Option<String> },
}

/// One established tcp connection. Sends are queued by the provider and
/// flushed outside the engine tick; the engine never blocks on a socket.
pub trait TcpLink: Send + Sync + std::fmt::Debug {
    fn send(&mut self, data: Bytes);
    fn close(&mut self);
    /// Stop/resume delivering [TransportEvent::Data] for this link
    fn set_paused(&mut self, paused: bool);
}

/// One bound udp socket. Inbound datagrams go to the channel handed over
/// at bind time.
pub trait UdpChannel: Send + Sync + std::fmt::Debug {
    fn send_to(&self, addr: SocketAddr, data: Bytes);
    fn local_port(&self) -> u16;
}

#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Start dialing. Completion is reported through the event channel as
    /// [TransportEvent::Connected] or [TransportEvent::Closed].
    fn connect_tcp(&self, addr: SocketAddr, events: flume::Sender<TransportEvent>) -> ConnId;

    /// Bind a listener; accepted links arrive as [TransportEvent::Accepted].
    /// Returns the locally bound port.
    async fn listen_tcp(
        &self,
        port: u16,
        events: flume::Sender<TransportEvent>,
    ) -> io::Result<u16>;

    async fn bind_udp(
        &self,
        port: u16,
        datagrams: flume::Sender<(SocketAddr, Bytes)>,
    ) -> io::Result<Box<dyn UdpChannel>>;

    /// Backpressure signal: providers should pause reads on all links
    /// while active. Optional, default is a no-op.
    fn set_backpressure(&self, _active: bool) {}
}

#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub is_file: bool,
}

/// Filesystem scoped by opaque root keys. Paths are always relative to a
/// root; the engine never learns where a root really lives.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn write_at(&self, root: &str, path: &Path, offset: u64, data: &[u8])
        -> io::Result<u64>;
    async fn read_at(
        &self,
        root: &str,
        path: &Path,
        offset: u64,
        length: usize,
    ) -> io::Result<Bytes>;
    async fn set_len(&self, root: &str, path: &Path, length: u64) -> io::Result<()>;
    async fn stat(&self, root: &str, path: &Path) -> io::Result<FileStat>;
    async fn exists(&self, root: &str, path: &Path) -> bool;
    async fn remove(&self, root: &str, path: &Path) -> io::Result<()>;
    async fn sync(&self, root: &str, path: &Path) -> io::Result<()>;
}

pub trait Hasher: Send + Sync {
    fn sha1(&self, data: &[u8]) -> [u8; 20];
}

/// Default hasher backed by the sha1 crate
#[derive(Debug, Default)]
pub struct Sha1Hasher;

impl Hasher for Sha1Hasher {
    fn sha1(&self, data: &[u8]) -> [u8; 20] {
        crate::utils::sha1(data)
    }
}

/// Keyed binary blob store for session persistence. Writes to one key are
/// serialized by the provider; reads may be concurrent.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Bytes>;
    async fn set(&self, key: &str, value: Bytes);
    async fn delete(&self, key: &str);
    async fn keys(&self, prefix: &str) -> Vec<String>;
}

pub async fn get_json<T: serde::de::DeserializeOwned>(
    store: &dyn SessionStore,
    key: &str,
) -> Option<T> {
    let raw = store.get(key).await?;
    serde_json::from_slice(&raw).ok()
}

pub async fn set_json<T: serde::Serialize>(store: &dyn SessionStore, key: &str, value: &T) {
    let raw = serde_json::to_vec(value).expect("session values serialize");
    store.set(key, raw.into()).await;
}

/// Injected time source. `now_unix_ms` is wall clock (may jump around
/// sleep); `monotonic` never goes backwards.
pub trait Clock: Send + Sync {
    fn now_unix_ms(&self) -> u64;
    fn monotonic(&self) -> Duration;
}

#[derive(Debug)]
pub struct SystemClock {
    started: std::time::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            started: std::time::Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn monotonic(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Injected randomness so tests can be replayed byte for byte
pub trait Entropy: Send + Sync {
    fn fill(&self, buf: &mut [u8]);

    fn random_u32(&self) -> u32 {
        let mut buf = [0; 4];
        self.fill(&mut buf);
        u32::from_be_bytes(buf)
    }

    fn random_id(&self) -> [u8; 20] {
        let mut id = [0; 20];
        self.fill(&mut id);
        id
    }
}

#[derive(Debug, Default)]
pub struct SystemEntropy;

impl Entropy for SystemEntropy {
    fn fill(&self, buf: &mut [u8]) {
        use rand::RngCore;
        rand::rng().fill_bytes(buf);
    }
}
