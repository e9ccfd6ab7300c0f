//! Platform-agnostic BitTorrent engine. Feed it a magnet link or
//! metainfo bytes and it discovers peers over trackers and the mainline
//! dht, speaks the wire protocol, verifies every piece and writes it to
//! storage. All I/O goes through injected capability traits so the same
//! engine runs on real sockets and files or fully in memory in tests.

pub mod bandwidth;
pub mod bitfield;
pub mod caps;
pub mod dht;
pub mod disk;
pub mod engine;
pub mod error;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod picker;
pub mod piece;
pub mod session;
pub mod swarm;
pub mod tracker;
pub mod utils;

pub use bitfield::BitField;
pub use engine::{
    Capabilities, Engine, EngineConfig, EngineEvent, EngineHandle, EngineStats, TickMode,
};
pub use error::{Error, ErrorKind};
pub use magnet::MagnetLink;
pub use metainfo::{Info, InfoHash, TorrentFile};
pub use picker::Priority;
pub use session::UserState;

use std::sync::Arc;

use disk::roots::StorageRootManager;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

impl Capabilities {
    /// Providers backed by the local machine: tokio sockets, the real
    /// filesystem behind the given storage roots, an in-memory session
    /// store unless the host supplies a durable one.
    pub fn local(roots: Arc<StorageRootManager>) -> Self {
        let task_tracker = TaskTracker::new();
        let cancellation_token = CancellationToken::new();
        Self {
            socket_factory: Arc::new(caps::tokio_net::TokioNet::new(
                task_tracker,
                cancellation_token,
            )),
            fs: Arc::new(caps::local_fs::LocalFileSystem::new(roots.clone())),
            hasher: Arc::new(caps::Sha1Hasher),
            session: Arc::new(caps::memory::MemorySessionStore::new()),
            clock: Arc::new(caps::SystemClock::default()),
            entropy: Arc::new(caps::SystemEntropy),
            roots,
        }
    }

    /// Fully deterministic in-memory providers for tests
    pub fn in_memory(roots: Arc<StorageRootManager>, seed: u64) -> (Self, caps::memory::MemoryNet, caps::memory::ManualClock) {
        let net = caps::memory::MemoryNet::new();
        let clock = caps::memory::ManualClock::new(1_700_000_000_000);
        let capabilities = Self {
            socket_factory: Arc::new(net.clone()),
            fs: Arc::new(caps::memory::MemoryFileSystem::new()),
            hasher: Arc::new(caps::Sha1Hasher),
            session: Arc::new(caps::memory::MemorySessionStore::new()),
            clock: Arc::new(clock.clone()),
            entropy: Arc::new(caps::memory::SeededEntropy::new(seed)),
            roots,
        };
        (capabilities, net, clock)
    }
}
