use std::{net::SocketAddr, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::{
    bandwidth::{Counters, RateWindow},
    bitfield::BitField,
    caps::{ConnId, Entropy},
    error::ErrorKind,
    metainfo::InfoHash,
};

use super::{
    mse,
    wire::{HandShake, MessageFramer, PeerMessage},
};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);
/// Closing this soon after connect with no payload marks the address as
/// flaky in the swarm
pub const QUICK_DISCONNECT_WINDOW: Duration = Duration::from_secs(30);

/// Why a connection went away. Only some reasons are the remote's fault;
/// the swarm scheduler cares about the difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    DialTimeout,
    HandshakeTimeout,
    HandshakeFailed,
    EncryptionFailed,
    InfoHashMismatch,
    PeerIdCollision,
    WireProtocol,
    IdleTimeout,
    TransportError,
    RemoteClosed,
    Banned,
    ShuttingDown,
}

impl CloseReason {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            CloseReason::DialTimeout | CloseReason::IdleTimeout => ErrorKind::PeerTimeout,
            CloseReason::HandshakeTimeout | CloseReason::HandshakeFailed => {
                ErrorKind::HandshakeFailed
            }
            CloseReason::EncryptionFailed => ErrorKind::EncryptionNegotiationFailed,
            CloseReason::InfoHashMismatch => ErrorKind::InfoHashMismatch,
            CloseReason::PeerIdCollision => ErrorKind::PeerIdCollision,
            CloseReason::WireProtocol => ErrorKind::WireProtocolError,
            CloseReason::TransportError | CloseReason::RemoteClosed => ErrorKind::PeerTimeout,
            CloseReason::Banned | CloseReason::ShuttingDown => ErrorKind::ShuttingDown,
        }
    }

    /// Counts as a connection failure against the address
    pub fn is_peer_fault(&self) -> bool {
        !matches!(self, CloseReason::Banned | CloseReason::ShuttingDown)
    }
}

#[derive(Debug)]
enum ConnState {
    Dialing,
    /// MSE key exchange in progress (outgoing), or sniffing whether the
    /// inbound stream is MSE or plaintext (incoming)
    Crypto,
    /// Waiting for the 68 byte BT handshake
    BtHandshake,
    Ready,
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
    pub endgame: bool,
}

/// What the torrent logic sees from a connection after feeding it input
#[derive(Debug)]
pub enum ConnEvent {
    /// Handshake finished; line is open for wire messages
    Ready { handshake: HandShake },
    Message(PeerMessage),
}

#[derive(Debug)]
pub enum ConnInput {
    Connected,
    Data(Bytes),
    Closed { error: Option<String> },
}

enum Crypto {
    None,
    Initiator(mse::Initiator),
    Responder(mse::Responder),
    /// Incoming and undecided between plaintext and MSE
    Sniffing,
}

impl std::fmt::Debug for Crypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Crypto::None => "None",
            Crypto::Initiator(_) => "Initiator",
            Crypto::Responder(_) => "Responder",
            Crypto::Sniffing => "Sniffing",
        };
        write!(f, "Crypto::{name}")
    }
}

/// One peer connection as an explicit state machine. Transport events go
/// in, decoded wire messages come out; outbound frames pile up in the
/// send buffer until the engine flushes them at tick end.
#[derive(Debug)]
pub struct PeerConnection {
    pub conn_id: ConnId,
    pub addr: SocketAddr,
    pub is_incoming: bool,
    /// Set for outgoing connections, learned from the handshake when
    /// incoming
    pub info_hash: Option<InfoHash>,
    our_peer_id: [u8; 20],
    state: ConnState,
    crypto: Crypto,
    cipher: Option<mse::Established>,
    /// Known torrents, for answering the MSE skey proof on incoming links
    known_hashes: Vec<InfoHash>,
    recv_buf: BytesMut,
    send_buf: BytesMut,
    framer: MessageFramer,

    pub peer_id: Option<[u8; 20]>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub bitfield: Option<BitField>,
    pub extension_handshake: Option<Box<super::extension::ExtensionHandshake>>,
    pub inflight: Vec<BlockRequest>,

    pub downloaded: u64,
    pub uploaded: u64,
    pub rate: RateWindow,
    /// Offset into the shared pex history this peer has seen
    pub pex_tip: usize,
    pub last_pex_at: Duration,

    created_at: Duration,
    connected_at: Option<Duration>,
    last_received_at: Duration,
    last_sent_at: Duration,
}

impl PeerConnection {
    pub fn outgoing(
        conn_id: ConnId,
        addr: SocketAddr,
        info_hash: InfoHash,
        our_peer_id: [u8; 20],
        mse_enabled: bool,
        now: Duration,
    ) -> Self {
        Self {
            conn_id,
            addr,
            is_incoming: false,
            info_hash: Some(info_hash),
            our_peer_id,
            state: ConnState::Dialing,
            crypto: if mse_enabled {
                Crypto::Sniffing // replaced by an initiator once connected
            } else {
                Crypto::None
            },
            cipher: None,
            known_hashes: Vec::new(),
            recv_buf: BytesMut::new(),
            send_buf: BytesMut::new(),
            framer: MessageFramer,
            peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: None,
            extension_handshake: None,
            inflight: Vec::new(),
            downloaded: 0,
            uploaded: 0,
            rate: RateWindow::new(),
            pex_tip: 0,
            last_pex_at: now,
            created_at: now,
            connected_at: None,
            last_received_at: now,
            last_sent_at: now,
        }
    }

    pub fn incoming(
        conn_id: ConnId,
        addr: SocketAddr,
        our_peer_id: [u8; 20],
        mse_enabled: bool,
        known_hashes: Vec<InfoHash>,
        now: Duration,
    ) -> Self {
        let mut conn = Self::outgoing(conn_id, addr, [0; 20], our_peer_id, false, now);
        conn.is_incoming = true;
        conn.info_hash = None;
        conn.known_hashes = known_hashes;
        if mse_enabled {
            conn.crypto = Crypto::Sniffing;
            conn.state = ConnState::Crypto;
        } else {
            conn.crypto = Crypto::None;
            conn.state = ConnState::BtHandshake;
        }
        conn.connected_at = Some(now);
        conn
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnState::Ready)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed(_))
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.state {
            ConnState::Closed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.as_ref().is_some_and(|c| c.is_encrypted())
    }

    pub fn close(&mut self, reason: CloseReason) {
        if !self.is_closed() {
            self.state = ConnState::Closed(reason);
        }
    }

    /// True when the link died right after connecting without moving
    /// payload in either direction
    pub fn is_quick_disconnect(&self, now: Duration) -> bool {
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        now.saturating_sub(connected_at) < QUICK_DISCONNECT_WINDOW
            && self.downloaded == 0
            && self.uploaded == 0
    }

    /// Drain bytes destined for the socket. Called by the batched sender
    /// at tick end.
    pub fn take_outgoing(&mut self) -> Option<Bytes> {
        if self.send_buf.is_empty() {
            return None;
        }
        Some(self.send_buf.split().freeze())
    }

    pub fn handle(
        &mut self,
        input: ConnInput,
        now: Duration,
        entropy: &dyn Entropy,
    ) -> Result<Vec<ConnEvent>, CloseReason> {
        match input {
            ConnInput::Connected => {
                self.connected_at = Some(now);
                self.last_received_at = now;
                debug_assert!(!self.is_incoming);
                if matches!(self.crypto, Crypto::Sniffing) {
                    let info_hash = self.info_hash.expect("outgoing conns know their torrent");
                    let (initiator, first) = mse::Initiator::new(info_hash, entropy);
                    self.crypto = Crypto::Initiator(initiator);
                    self.send_buf.extend_from_slice(&first);
                    self.state = ConnState::Crypto;
                } else {
                    self.send_handshake();
                    self.state = ConnState::BtHandshake;
                }
                Ok(Vec::new())
            }
            ConnInput::Data(data) => {
                self.last_received_at = now;
                self.on_bytes(data, entropy)
            }
            ConnInput::Closed { error } => {
                let reason = match (&self.state, error) {
                    (ConnState::Dialing, _) => CloseReason::TransportError,
                    (_, Some(_)) => CloseReason::TransportError,
                    (_, None) => CloseReason::RemoteClosed,
                };
                self.state = ConnState::Closed(reason);
                Err(reason)
            }
        }
    }

    /// Timeout sweep; emits a keep-alive when the line has been quiet
    pub fn on_tick(&mut self, now: Duration, idle_timeout: Duration) -> Option<CloseReason> {
        match self.state {
            ConnState::Dialing => {
                if now.saturating_sub(self.created_at) > DIAL_TIMEOUT {
                    return Some(CloseReason::DialTimeout);
                }
            }
            ConnState::Crypto | ConnState::BtHandshake => {
                let started = self.connected_at.unwrap_or(self.created_at);
                if now.saturating_sub(started) > HANDSHAKE_TIMEOUT {
                    return Some(CloseReason::HandshakeTimeout);
                }
            }
            ConnState::Ready => {
                if now.saturating_sub(self.last_received_at) > idle_timeout {
                    return Some(CloseReason::IdleTimeout);
                }
                if now.saturating_sub(self.last_sent_at) > KEEP_ALIVE_INTERVAL {
                    self.push_message(&PeerMessage::KeepAlive, now);
                }
            }
            ConnState::Closed(_) => {}
        }
        None
    }

    /// Sample the transfer counters into the rate window; once per tick
    pub fn sample_rate(&mut self) {
        self.rate.sample(Counters::new(self.downloaded, self.uploaded));
    }

    fn on_bytes(
        &mut self,
        data: Bytes,
        entropy: &dyn Entropy,
    ) -> Result<Vec<ConnEvent>, CloseReason> {
        match &self.state {
            ConnState::Crypto => {
                self.recv_buf.extend_from_slice(&data);
                self.drive_crypto(entropy)
            }
            ConnState::BtHandshake | ConnState::Ready => {
                let mut decrypted = BytesMut::from(&data[..]);
                if let Some(cipher) = &mut self.cipher {
                    cipher.decrypt(&mut decrypted);
                }
                self.recv_buf.extend_from_slice(&decrypted);
                self.drive_stream()
            }
            ConnState::Dialing => {
                // data before connect callback cannot happen
                Err(CloseReason::TransportError)
            }
            ConnState::Closed(reason) => Err(*reason),
        }
    }

    fn drive_crypto(&mut self, entropy: &dyn Entropy) -> Result<Vec<ConnEvent>, CloseReason> {
        // incoming links first decide between plaintext and MSE
        if matches!(self.crypto, Crypto::Sniffing) {
            let Some(&first) = self.recv_buf.first() else {
                return Ok(Vec::new());
            };
            let plaintext = if first == 0x13 {
                if self.recv_buf.len() < 20 {
                    return Ok(Vec::new());
                }
                &self.recv_buf[1..20] == super::wire::PSTR
            } else {
                false
            };
            if plaintext {
                self.crypto = Crypto::None;
                self.state = ConnState::BtHandshake;
                return self.drive_stream();
            }
            self.crypto = Crypto::Responder(mse::Responder::new(
                std::mem::take(&mut self.known_hashes),
                entropy,
            ));
        }

        let mut out = BytesMut::new();
        let progress = match &mut self.crypto {
            Crypto::Initiator(initiator) => initiator.on_data(&mut self.recv_buf, &mut out),
            Crypto::Responder(responder) => {
                responder.on_data(&mut self.recv_buf, &mut out, entropy)
            }
            Crypto::None | Crypto::Sniffing => unreachable!("crypto state is settled above"),
        };
        self.send_buf.extend_from_slice(&out);
        match progress {
            Ok(mse::Progress::Pending) => Ok(Vec::new()),
            Ok(mse::Progress::Established(established)) => {
                self.cipher = Some(established);
                self.crypto = Crypto::None;
                self.state = ConnState::BtHandshake;
                if !self.is_incoming {
                    self.send_handshake();
                }
                // leftover bytes in recv_buf are already decrypted
                self.drive_stream()
            }
            Err(e) => {
                tracing::debug!(addr = %self.addr, "Encryption negotiation failed: {e}");
                Err(CloseReason::EncryptionFailed)
            }
        }
    }

    fn drive_stream(&mut self) -> Result<Vec<ConnEvent>, CloseReason> {
        let mut events = Vec::new();
        if matches!(self.state, ConnState::BtHandshake) {
            if self.recv_buf.len() < HandShake::SIZE {
                return Ok(events);
            }
            let handshake = match HandShake::from_bytes(&self.recv_buf[..HandShake::SIZE]) {
                Ok(handshake) => handshake,
                Err(e) => {
                    tracing::debug!(addr = %self.addr, "Bad handshake: {e}");
                    return Err(CloseReason::HandshakeFailed);
                }
            };
            let _ = self.recv_buf.split_to(HandShake::SIZE);
            if let Some(expected) = self.info_hash {
                if handshake.info_hash != expected {
                    return Err(CloseReason::InfoHashMismatch);
                }
            } else {
                self.info_hash = Some(handshake.info_hash);
            }
            if handshake.peer_id == self.our_peer_id {
                return Err(CloseReason::PeerIdCollision);
            }
            if self.is_incoming {
                // mirror the handshake back now that the torrent is known
                self.send_handshake();
            }
            self.peer_id = Some(handshake.peer_id);
            self.state = ConnState::Ready;
            events.push(ConnEvent::Ready { handshake });
        }

        loop {
            match self.framer.decode(&mut self.recv_buf) {
                Ok(Some(message)) => {
                    self.apply_message(&message);
                    events.push(ConnEvent::Message(message));
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(addr = %self.addr, "Malformed frame: {e}");
                    return Err(CloseReason::WireProtocol);
                }
            }
        }
        Ok(events)
    }

    /// Track the connection-intrinsic side of an inbound message
    fn apply_message(&mut self, message: &PeerMessage) {
        match message {
            PeerMessage::Choke => {
                self.peer_choking = true;
                // outstanding non endgame requests are forfeit
                self.inflight.retain(|r| r.endgame);
            }
            PeerMessage::Unchoke => self.peer_choking = false,
            PeerMessage::Interested => self.peer_interested = true,
            PeerMessage::NotInterested => self.peer_interested = false,
            PeerMessage::Bitfield { payload } => self.bitfield = Some(payload.clone()),
            PeerMessage::Have { index } => {
                if let Some(bitfield) = &mut self.bitfield {
                    let _ = bitfield.add(*index as usize);
                }
            }
            PeerMessage::Piece { index, begin, block } => {
                self.downloaded += block.len() as u64;
                if let Some(pos) = self
                    .inflight
                    .iter()
                    .position(|r| r.index == *index && r.begin == *begin)
                {
                    self.inflight.swap_remove(pos);
                }
            }
            PeerMessage::ExtensionHandshake { payload } => {
                self.extension_handshake = Some(Box::new(payload.clone()));
            }
            _ => {}
        }
    }

    fn send_handshake(&mut self) {
        let info_hash = self.info_hash.expect("handshake needs a torrent");
        let handshake = HandShake::new(info_hash, self.our_peer_id);
        let mut bytes = BytesMut::from(&handshake.as_bytes()[..]);
        if let Some(cipher) = &mut self.cipher {
            cipher.encrypt(&mut bytes);
        }
        self.send_buf.extend_from_slice(&bytes);
    }

    fn push_message(&mut self, message: &PeerMessage, now: Duration) {
        let mut frame = BytesMut::new();
        message.encode(&mut frame);
        if let Some(cipher) = &mut self.cipher {
            cipher.encrypt(&mut frame);
        }
        self.send_buf.extend_from_slice(&frame);
        self.last_sent_at = now;
    }

    pub fn send_bitfield(&mut self, bitfield: BitField, now: Duration) {
        self.push_message(&PeerMessage::Bitfield { payload: bitfield }, now);
    }

    pub fn send_have(&mut self, index: u32, now: Duration) {
        self.push_message(&PeerMessage::Have { index }, now);
    }

    pub fn send_interested(&mut self, now: Duration) {
        if !self.am_interested {
            self.am_interested = true;
            self.push_message(&PeerMessage::Interested, now);
        }
    }

    pub fn send_not_interested(&mut self, now: Duration) {
        if self.am_interested {
            self.am_interested = false;
            self.push_message(&PeerMessage::NotInterested, now);
        }
    }

    pub fn send_choke(&mut self, now: Duration) {
        if !self.am_choking {
            self.am_choking = true;
            self.push_message(&PeerMessage::Choke, now);
        }
    }

    pub fn send_unchoke(&mut self, now: Duration) {
        if self.am_choking {
            self.am_choking = false;
            self.push_message(&PeerMessage::Unchoke, now);
        }
    }

    /// New requests are refused while the peer chokes us, endgame
    /// duplicates excepted when they were already in flight elsewhere
    pub fn send_request(&mut self, request: BlockRequest, now: Duration) -> bool {
        if self.peer_choking {
            return false;
        }
        if self
            .inflight
            .iter()
            .any(|r| r.index == request.index && r.begin == request.begin)
        {
            return false;
        }
        self.inflight.push(request);
        self.push_message(
            &PeerMessage::Request {
                index: request.index,
                begin: request.begin,
                length: request.length,
            },
            now,
        );
        true
    }

    pub fn send_cancel(&mut self, index: u32, begin: u32, length: u32, now: Duration) {
        if let Some(pos) = self
            .inflight
            .iter()
            .position(|r| r.index == index && r.begin == begin)
        {
            self.inflight.swap_remove(pos);
            self.push_message(
                &PeerMessage::Cancel {
                    index,
                    begin,
                    length,
                },
                now,
            );
        }
    }

    /// Upload one block. Never emitted while we are choking the peer.
    pub fn send_piece(&mut self, index: u32, begin: u32, block: Bytes, now: Duration) -> bool {
        if self.am_choking {
            return false;
        }
        self.uploaded += block.len() as u64;
        self.push_message(
            &PeerMessage::Piece {
                index,
                begin,
                block,
            },
            now,
        );
        true
    }

    pub fn send_port(&mut self, port: u16, now: Duration) {
        self.push_message(&PeerMessage::Port { port }, now);
    }

    pub fn send_extension_handshake(
        &mut self,
        payload: super::extension::ExtensionHandshake,
        now: Duration,
    ) {
        self.push_message(&PeerMessage::ExtensionHandshake { payload }, now);
    }

    pub fn send_extension(&mut self, extension_id: u8, payload: Bytes, now: Duration) {
        self.push_message(
            &PeerMessage::Extension {
                extension_id,
                payload,
            },
            now,
        );
    }

    pub fn peer_has(&self, piece: usize) -> bool {
        self.bitfield.as_ref().is_some_and(|bf| bf.has(piece))
    }

    pub fn client_name(&self) -> &'static str {
        self.peer_id
            .as_ref()
            .map(super::fingerprint::client_name)
            .unwrap_or("Unknown")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;

    use crate::{
        bitfield::BitField,
        caps::memory::SeededEntropy,
        peer::wire::{HandShake, PeerMessage},
    };

    use super::*;

    const NOW: Duration = Duration::from_secs(100);

    fn ready_outgoing_conn() -> (PeerConnection, SeededEntropy) {
        let entropy = SeededEntropy::new(3);
        let mut conn = PeerConnection::outgoing(
            1,
            "10.0.0.1:6881".parse().unwrap(),
            [7; 20],
            *b"-RP0100-aaaaaaaaaaaa",
            false,
            NOW,
        );
        conn.handle(ConnInput::Connected, NOW, &entropy).unwrap();
        // our handshake goes out immediately
        let sent = conn.take_outgoing().unwrap();
        assert_eq!(sent.len(), HandShake::SIZE);

        let peer_handshake = HandShake::new([7; 20], *b"-qB4520-bbbbbbbbbbbb");
        let events = conn
            .handle(
                ConnInput::Data(peer_handshake.as_bytes().to_vec().into()),
                NOW,
                &entropy,
            )
            .unwrap();
        assert!(matches!(events[0], ConnEvent::Ready { .. }));
        assert!(conn.is_ready());
        (conn, entropy)
    }

    fn frame(message: PeerMessage) -> bytes::Bytes {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        buf.freeze()
    }

    #[test]
    fn outgoing_plaintext_handshake() {
        let (conn, _) = ready_outgoing_conn();
        assert_eq!(conn.peer_id, Some(*b"-qB4520-bbbbbbbbbbbb"));
        assert_eq!(conn.client_name(), "qBittorrent");
        assert!(!conn.is_encrypted());
    }

    #[test]
    fn info_hash_mismatch_closes() {
        let entropy = SeededEntropy::new(3);
        let mut conn = PeerConnection::outgoing(
            1,
            "10.0.0.1:6881".parse().unwrap(),
            [7; 20],
            *b"-RP0100-aaaaaaaaaaaa",
            false,
            NOW,
        );
        conn.handle(ConnInput::Connected, NOW, &entropy).unwrap();
        let wrong = HandShake::new([8; 20], *b"-qB4520-bbbbbbbbbbbb");
        let err = conn
            .handle(
                ConnInput::Data(wrong.as_bytes().to_vec().into()),
                NOW,
                &entropy,
            )
            .unwrap_err();
        assert_eq!(err, CloseReason::InfoHashMismatch);
    }

    #[test]
    fn own_peer_id_is_a_collision() {
        let entropy = SeededEntropy::new(3);
        let our_id = *b"-RP0100-aaaaaaaaaaaa";
        let mut conn = PeerConnection::outgoing(
            1,
            "10.0.0.1:6881".parse().unwrap(),
            [7; 20],
            our_id,
            false,
            NOW,
        );
        conn.handle(ConnInput::Connected, NOW, &entropy).unwrap();
        let loopback = HandShake::new([7; 20], our_id);
        let err = conn
            .handle(
                ConnInput::Data(loopback.as_bytes().to_vec().into()),
                NOW,
                &entropy,
            )
            .unwrap_err();
        assert_eq!(err, CloseReason::PeerIdCollision);
    }

    #[test]
    fn choke_flags_follow_messages() {
        let (mut conn, entropy) = ready_outgoing_conn();
        assert!(conn.peer_choking);
        let events = conn
            .handle(ConnInput::Data(frame(PeerMessage::Unchoke)), NOW, &entropy)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(!conn.peer_choking);

        // request flows only while unchoked
        assert!(conn.send_request(
            BlockRequest {
                index: 0,
                begin: 0,
                length: 16384,
                endgame: false
            },
            NOW,
        ));
        assert_eq!(conn.inflight.len(), 1);

        conn.handle(ConnInput::Data(frame(PeerMessage::Choke)), NOW, &entropy)
            .unwrap();
        assert!(conn.peer_choking);
        // non endgame requests forfeit on choke
        assert!(conn.inflight.is_empty());
        assert!(!conn.send_request(
            BlockRequest {
                index: 0,
                begin: 0,
                length: 16384,
                endgame: false
            },
            NOW,
        ));
    }

    #[test]
    fn choke_unchoke_emitted_only_on_change() {
        let (mut conn, _) = ready_outgoing_conn();
        conn.take_outgoing();
        conn.send_unchoke(NOW);
        assert!(conn.take_outgoing().is_some());
        conn.send_unchoke(NOW);
        assert!(conn.take_outgoing().is_none());
        conn.send_choke(NOW);
        assert!(conn.take_outgoing().is_some());
        conn.send_choke(NOW);
        assert!(conn.take_outgoing().is_none());
    }

    #[test]
    fn no_piece_while_choking() {
        let (mut conn, _) = ready_outgoing_conn();
        conn.take_outgoing();
        assert!(conn.am_choking);
        assert!(!conn.send_piece(0, 0, vec![1; 16].into(), NOW));
        assert!(conn.take_outgoing().is_none());
        conn.send_unchoke(NOW);
        assert!(conn.send_piece(0, 0, vec![1; 16].into(), NOW));
        assert_eq!(conn.uploaded, 16);
    }

    #[test]
    fn piece_clears_matching_request() {
        let (mut conn, entropy) = ready_outgoing_conn();
        conn.handle(ConnInput::Data(frame(PeerMessage::Unchoke)), NOW, &entropy)
            .unwrap();
        conn.send_request(
            BlockRequest {
                index: 3,
                begin: 16384,
                length: 16384,
                endgame: false,
            },
            NOW,
        );
        let piece = PeerMessage::Piece {
            index: 3,
            begin: 16384,
            block: vec![0; 16384].into(),
        };
        conn.handle(ConnInput::Data(frame(piece)), NOW, &entropy)
            .unwrap();
        assert!(conn.inflight.is_empty());
        assert_eq!(conn.downloaded, 16384);
    }

    #[test]
    fn timeouts_fire_in_order() {
        let entropy = SeededEntropy::new(3);
        let mut conn = PeerConnection::outgoing(
            1,
            "10.0.0.1:6881".parse().unwrap(),
            [7; 20],
            *b"-RP0100-aaaaaaaaaaaa",
            false,
            NOW,
        );
        assert!(conn.on_tick(NOW + Duration::from_secs(10), Duration::from_secs(120)).is_none());
        assert_eq!(
            conn.on_tick(NOW + Duration::from_secs(31), Duration::from_secs(120)),
            Some(CloseReason::DialTimeout)
        );

        conn.handle(ConnInput::Connected, NOW, &entropy).unwrap();
        assert_eq!(
            conn.on_tick(NOW + Duration::from_secs(16), Duration::from_secs(120)),
            Some(CloseReason::HandshakeTimeout)
        );
    }

    #[test]
    fn idle_peer_times_out_and_keepalive_is_sent() {
        let (mut conn, _) = ready_outgoing_conn();
        conn.take_outgoing();
        // quiet for over a minute triggers a keep-alive
        assert!(conn
            .on_tick(NOW + Duration::from_secs(61), Duration::from_secs(120))
            .is_none());
        let out = conn.take_outgoing().unwrap();
        assert_eq!(&out[..], &[0, 0, 0, 0]);
        // quiet past the idle timeout kills the link
        assert_eq!(
            conn.on_tick(NOW + Duration::from_secs(200), Duration::from_secs(120)),
            Some(CloseReason::IdleTimeout)
        );
    }

    #[test]
    fn incoming_plaintext_handshake_mirrors_back() {
        let entropy = SeededEntropy::new(3);
        let mut conn = PeerConnection::incoming(
            9,
            "10.0.0.2:51413".parse().unwrap(),
            *b"-RP0100-aaaaaaaaaaaa",
            true,
            vec![[7; 20]],
            NOW,
        );
        let remote = HandShake::new([7; 20], *b"-TR4000-cccccccccccc");
        let events = conn
            .handle(
                ConnInput::Data(remote.as_bytes().to_vec().into()),
                NOW,
                &entropy,
            )
            .unwrap();
        assert!(matches!(events[0], ConnEvent::Ready { .. }));
        assert_eq!(conn.info_hash, Some([7; 20]));
        let reply = conn.take_outgoing().unwrap();
        let ours = HandShake::from_bytes(&reply).unwrap();
        assert_eq!(ours.info_hash, [7; 20]);
    }

    #[test]
    fn encrypted_session_end_to_end() {
        let entropy_a = SeededEntropy::new(5);
        let entropy_b = SeededEntropy::new(6);
        let info_hash = [7; 20];
        let mut dialer = PeerConnection::outgoing(
            1,
            "10.0.0.2:6881".parse().unwrap(),
            info_hash,
            *b"-RP0100-aaaaaaaaaaaa",
            true,
            NOW,
        );
        let mut listener = PeerConnection::incoming(
            2,
            "10.0.0.1:50000".parse().unwrap(),
            *b"-RP0100-bbbbbbbbbbbb",
            true,
            vec![info_hash],
            NOW,
        );
        dialer.handle(ConnInput::Connected, NOW, &entropy_a).unwrap();

        let mut dialer_ready = false;
        let mut listener_ready = false;
        for _ in 0..12 {
            if let Some(bytes) = dialer.take_outgoing() {
                for event in listener
                    .handle(ConnInput::Data(bytes), NOW, &entropy_b)
                    .unwrap()
                {
                    if matches!(event, ConnEvent::Ready { .. }) {
                        listener_ready = true;
                    }
                }
            }
            if let Some(bytes) = listener.take_outgoing() {
                for event in dialer
                    .handle(ConnInput::Data(bytes), NOW, &entropy_a)
                    .unwrap()
                {
                    if matches!(event, ConnEvent::Ready { .. }) {
                        dialer_ready = true;
                    }
                }
            }
        }
        assert!(dialer_ready);
        assert!(listener_ready);
        assert!(dialer.is_encrypted());
        assert!(listener.is_encrypted());

        // an encrypted wire message makes it across
        dialer.send_bitfield(BitField::new(&[0b10100000]), NOW);
        let bytes = dialer.take_outgoing().unwrap();
        let events = listener
            .handle(ConnInput::Data(bytes), NOW, &entropy_b)
            .unwrap();
        assert!(matches!(
            &events[..],
            [ConnEvent::Message(PeerMessage::Bitfield { .. })]
        ));
    }
}
