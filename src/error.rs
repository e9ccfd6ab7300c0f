use std::fmt::Display;

/// Typed failure kinds surfaced by the engine.
///
/// Most of these never reach the caller directly: peer-attributable errors
/// close the peer and feed swarm counters, tracker errors degrade a single
/// tracker. The kinds that do surface are attached to torrent state or
/// emitted as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    HandshakeFailed,
    InfoHashMismatch,
    PeerIdCollision,
    WireProtocolError,
    PeerTimeout,
    PeerChoked,
    EncryptionNegotiationFailed,
    TrackerProtocolError,
    TrackerUnreachable,
    DhtQueryTimeout,
    DhtBadToken,
    HashMismatch,
    DiskIoError,
    StorageRootMissing,
    StorageRootQuotaExceeded,
    SessionPersistenceCorrupt,
    MetainfoInvalid,
    MagnetInvalid,
    ShuttingDown,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::HandshakeFailed => "handshake failed",
            ErrorKind::InfoHashMismatch => "info hash mismatch",
            ErrorKind::PeerIdCollision => "peer id collision",
            ErrorKind::WireProtocolError => "wire protocol error",
            ErrorKind::PeerTimeout => "peer timeout",
            ErrorKind::PeerChoked => "peer choked",
            ErrorKind::EncryptionNegotiationFailed => "encryption negotiation failed",
            ErrorKind::TrackerProtocolError => "tracker protocol error",
            ErrorKind::TrackerUnreachable => "tracker unreachable",
            ErrorKind::DhtQueryTimeout => "dht query timeout",
            ErrorKind::DhtBadToken => "dht bad token",
            ErrorKind::HashMismatch => "hash mismatch",
            ErrorKind::DiskIoError => "disk io error",
            ErrorKind::StorageRootMissing => "storage root missing",
            ErrorKind::StorageRootQuotaExceeded => "storage root quota exceeded",
            ErrorKind::SessionPersistenceCorrupt => "session persistence corrupt",
            ErrorKind::MetainfoInvalid => "metainfo invalid",
            ErrorKind::MagnetInvalid => "magnet invalid",
            ErrorKind::ShuttingDown => "shutting down",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.msg)
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
