use std::{
    collections::HashMap,
    net::SocketAddr,
    num::NonZeroUsize,
    ops::Range,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    bandwidth::pipeline_depth,
    bitfield::BitField,
    caps::{ConnId, Entropy, FileSystem, RootKey},
    disk::{DiskQueue, Segment, VerifiedWrite, WriteOutcome},
    error::{Error, ErrorKind},
    metainfo::{hex_hash, Info, InfoHash},
    peer::{
        conn::{BlockRequest, CloseReason, PeerConnection},
        extension::{Extension, ExtensionHandshake},
        pex::{PexHistory, PexHistoryEntry, PexMessage},
        ut_metadata::{UtMessage, UtMetadata},
        PeerMessage,
    },
    picker::Priority,
    piece::{Block, BlockReceipt, PieceManager},
    session::UserState,
    swarm::{PeerSource, Swarm},
    tracker::{DownloadStat, TrackerManager},
};

use super::{EngineConfig, EngineEvent};

const CHOKE_REVIEW_INTERVAL: Duration = Duration::from_secs(10);
const OPTIMISTIC_ROTATE_INTERVAL: Duration = Duration::from_secs(30);
const UNCHOKE_SLOTS: usize = 4;
const PEX_MESSAGE_INTERVAL: Duration = Duration::from_secs(90);
/// Unused pex history entries that trigger a cleanup
const PEX_HISTORY_CLEANUP_THRESHOLD: usize = 500;
const STALLED_PIECE_DEADLINE: Duration = Duration::from_secs(90);
const PIECE_CACHE_SIZE: usize = 16;

/// Derived presentation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Paused,
    FetchingMetadata,
    /// Running but no peer is connected
    Stalled,
    Downloading,
    Seeding,
    Errored,
}

#[derive(Debug, Clone)]
pub struct TorrentFileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub priority: Priority,
}

/// Everything the engine tracks for one torrent
pub struct Torrent {
    pub info_hash: InfoHash,
    pub name: String,
    pub magnet: Option<String>,
    pub info: Option<Info>,
    pub files: Vec<TorrentFileEntry>,
    file_spans: Vec<(Range<u64>, PathBuf)>,
    pub root_key: RootKey,
    pub user_state: UserState,
    pub error: Option<Error>,
    pub added_at: u64,
    pub completed_at: Option<u64>,
    pub total_downloaded: u64,
    pub total_uploaded: u64,

    pub swarm: Swarm,
    pub pieces: Option<PieceManager>,
    pub trackers: TrackerManager,
    conns: HashMap<ConnId, PeerConnection>,
    conn_by_addr: HashMap<SocketAddr, ConnId>,

    /// BEP 9 exchange, fetching on magnet-only torrents, serving always
    metadata: Option<UtMetadata>,
    pex_history: PexHistory,
    last_choke_review: Duration,
    last_optimistic_rotate: Duration,
    optimistic_slot: Option<SocketAddr>,
    /// Verified-write completions still in flight, by piece index
    pending_writes: Vec<(u32, Vec<SocketAddr>, oneshot::Receiver<WriteOutcome>)>,
    /// Disk reads serving peer requests
    pending_reads: Vec<(ConnId, Block, oneshot::Receiver<std::io::Result<Bytes>>)>,
    piece_cache: lru::LruCache<u32, Bytes>,
}

impl std::fmt::Debug for Torrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Torrent")
            .field("info_hash", &hex_hash(&self.info_hash))
            .field("name", &self.name)
            .field("peers", &self.conns.len())
            .finish()
    }
}

/// Engine resources a torrent needs during one tick
pub struct TorrentCtx<'a> {
    pub now: Duration,
    pub now_wall_ms: u64,
    pub config: &'a EngineConfig,
    pub our_peer_id: [u8; 20],
    pub listen_port: u16,
    pub entropy: &'a dyn Entropy,
    pub fs: &'a Arc<dyn FileSystem>,
    pub disk: &'a mut DiskQueue,
    pub task_tracker: &'a TaskTracker,
    pub cancellation_token: &'a CancellationToken,
    pub events: &'a mut Vec<EngineEvent>,
    /// Local dht port advertised with PORT messages, when the dht runs
    pub dht_port: Option<u16>,
}

impl Torrent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info_hash: InfoHash,
        name: String,
        magnet: Option<String>,
        info: Option<Info>,
        trackers: TrackerManager,
        root_key: RootKey,
        user_state: UserState,
        added_at: u64,
        now: Duration,
    ) -> Self {
        let mut this = Self {
            info_hash,
            name,
            magnet,
            info: None,
            files: Vec::new(),
            file_spans: Vec::new(),
            root_key,
            user_state,
            error: None,
            added_at,
            completed_at: None,
            total_downloaded: 0,
            total_uploaded: 0,
            swarm: Swarm::new(),
            pieces: None,
            trackers,
            conns: HashMap::new(),
            conn_by_addr: HashMap::new(),
            metadata: None,
            pex_history: PexHistory::new(),
            last_choke_review: now,
            last_optimistic_rotate: now,
            optimistic_slot: None,
            pending_writes: Vec::new(),
            pending_reads: Vec::new(),
            piece_cache: lru::LruCache::new(NonZeroUsize::new(PIECE_CACHE_SIZE).unwrap()),
        };
        if let Some(info) = info {
            this.install_info(info, None, 256);
        }
        this
    }

    /// Attach the metainfo (from file, session, or a finished BEP 9
    /// fetch) and build the piece manager around it
    pub fn install_info(
        &mut self,
        info: Info,
        restored_bitfield: Option<BitField>,
        max_active_pieces: usize,
    ) {
        let bitfield =
            restored_bitfield.unwrap_or_else(|| BitField::empty(info.pieces_amount()));
        let mut pieces = PieceManager::new(&info, bitfield, max_active_pieces);

        let output_files = info.output_files("");
        let mut offset = 0u64;
        self.files = Vec::with_capacity(output_files.len());
        self.file_spans = Vec::with_capacity(output_files.len());
        for file in &output_files {
            let span = offset..offset + file.length();
            self.files.push(TorrentFileEntry {
                path: file.path().clone(),
                length: file.length(),
                priority: Priority::Normal,
            });
            self.file_spans.push((span, file.path().clone()));
            offset += file.length();
        }
        let priorities: Vec<_> = self
            .file_spans
            .iter()
            .zip(&self.files)
            .map(|((span, _), file)| (span.clone(), file.priority))
            .collect();
        pieces.apply_file_priorities(&priorities);

        // feed availability from peers that arrived before the metadata
        for conn in self.conns.values() {
            if let Some(bitfield) = &conn.bitfield {
                pieces.picker.peer_joined(bitfield);
            }
        }

        self.name = info.name.clone();
        self.metadata = Some(UtMetadata::full_from_info(&info));
        self.pieces = Some(pieces);
        self.info = Some(info);
    }

    pub fn has_metadata(&self) -> bool {
        self.info.is_some()
    }

    pub fn connected_peers(&self) -> usize {
        self.conns.values().filter(|c| c.is_ready()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.as_ref().is_some_and(|p| p.is_finished())
    }

    pub fn activity_state(&self) -> ActivityState {
        if self.error.is_some() {
            return ActivityState::Errored;
        }
        if self.user_state == UserState::Paused {
            return ActivityState::Paused;
        }
        if !self.has_metadata() {
            return ActivityState::FetchingMetadata;
        }
        if self.is_complete() {
            return ActivityState::Seeding;
        }
        if self.connected_peers() == 0 {
            return ActivityState::Stalled;
        }
        ActivityState::Downloading
    }

    pub fn download_stat(&self) -> DownloadStat {
        let left = self.pieces.as_ref().map_or(0, |p| p.left_amount());
        DownloadStat {
            downloaded: self.total_downloaded,
            uploaded: self.total_uploaded,
            left,
        }
    }

    pub fn set_file_priority(&mut self, file_idx: usize, priority: Priority) {
        let Some(file) = self.files.get_mut(file_idx) else {
            return;
        };
        file.priority = priority;
        if let Some(pieces) = &mut self.pieces {
            let priorities: Vec<_> = self
                .file_spans
                .iter()
                .zip(&self.files)
                .map(|((span, _), file)| (span.clone(), file.priority))
                .collect();
            pieces.apply_file_priorities(&priorities);
        }
    }

    pub fn conn(&mut self, conn_id: ConnId) -> Option<&mut PeerConnection> {
        self.conns.get_mut(&conn_id)
    }

    pub fn conn_ids(&self) -> Vec<ConnId> {
        self.conns.keys().copied().collect()
    }

    pub fn take_outgoing(&mut self) -> Vec<(ConnId, Bytes)> {
        let mut out = Vec::new();
        for (conn_id, conn) in self.conns.iter_mut() {
            if let Some(bytes) = conn.take_outgoing() {
                out.push((*conn_id, bytes));
            }
        }
        out
    }

    /// Track a dialing or freshly accepted connection. An address keeps
    /// its first live connection; duplicates are closed at handshake.
    pub fn adopt_conn(&mut self, conn: PeerConnection) {
        self.conn_by_addr.entry(conn.addr).or_insert(conn.conn_id);
        self.conns.insert(conn.conn_id, conn);
    }

    pub fn knows_conn(&self, conn_id: ConnId) -> bool {
        self.conns.contains_key(&conn_id)
    }

    /// The handshake finished on one of our connections
    pub fn on_conn_ready(&mut self, conn_id: ConnId, ctx: &mut TorrentCtx<'_>) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        let addr = conn.addr;
        if conn.is_incoming {
            if !self.swarm.accept_incoming(addr, ctx.now) {
                conn.close(CloseReason::Banned);
                return;
            }
        } else {
            self.swarm.mark_connected(addr, ctx.now);
        }
        self.swarm.set_client_name(addr, conn.client_name().to_owned());

        // bitfield first, then the extension handshake (BEP 10)
        if let Some(pieces) = &self.pieces {
            conn.send_bitfield(pieces.bitfield.clone(), ctx.now);
        }
        let mut handshake =
            ExtensionHandshake::ours(&ctx.config.client_name, ctx.config.pipeline_depth_max);
        if let Some(metadata) = &self.metadata {
            handshake.set_metadata_size(metadata.size);
        }
        handshake.set_your_ip(addr.ip());
        conn.send_extension_handshake(handshake, ctx.now);
        if let Some(dht_port) = ctx.dht_port {
            conn.send_port(dht_port, ctx.now);
        }

        self.pex_history.push_value(PexHistoryEntry::added(addr));
    }

    /// One decoded wire message from a ready connection
    pub fn on_message(&mut self, conn_id: ConnId, message: PeerMessage, ctx: &mut TorrentCtx<'_>) {
        match message {
            PeerMessage::KeepAlive | PeerMessage::Choke | PeerMessage::Unchoke => {
                // connection-level flags were already updated
            }
            PeerMessage::Interested | PeerMessage::NotInterested => {}
            PeerMessage::Have { index } => {
                if let Some(pieces) = &mut self.pieces {
                    pieces.picker.peer_has(index as usize);
                }
            }
            PeerMessage::Bitfield { payload } => {
                if let Some(pieces) = &mut self.pieces {
                    if payload.validate(pieces.pieces_amount()).is_err() {
                        if let Some(conn) = self.conns.get_mut(&conn_id) {
                            conn.close(CloseReason::WireProtocol);
                        }
                        return;
                    }
                    pieces.picker.peer_joined(&payload);
                }
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            } => {
                self.serve_block(
                    conn_id,
                    Block {
                        piece: index,
                        offset: begin,
                        length,
                    },
                    ctx,
                );
            }
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                self.on_block(
                    conn_id,
                    Block {
                        piece: index,
                        offset: begin,
                        length: block.len() as u32,
                    },
                    block,
                    ctx,
                );
            }
            PeerMessage::Cancel { .. } => {
                // uploads are answered within the tick; nothing to call off
            }
            PeerMessage::Port { .. } => {
                // surfaced by the engine to the dht
            }
            PeerMessage::ExtensionHandshake { .. } => {
                self.start_metadata_fetch(conn_id, ctx);
            }
            PeerMessage::Extension {
                extension_id,
                payload,
            } => {
                self.on_extension_message(conn_id, extension_id, payload, ctx);
            }
            PeerMessage::Unknown { id } => {
                tracing::trace!(id, "Ignoring unknown message");
            }
        }
    }

    fn on_extension_message(
        &mut self,
        conn_id: ConnId,
        extension_id: u8,
        payload: Bytes,
        ctx: &mut TorrentCtx<'_>,
    ) {
        match extension_id {
            UtMessage::CLIENT_ID => {
                if let Err(e) = self.on_ut_metadata(conn_id, payload, ctx) {
                    tracing::warn!("Failed to process ut_metadata message: {e}");
                }
            }
            PexMessage::CLIENT_ID => match PexMessage::from_bytes(&payload) {
                Ok(message) => {
                    tracing::debug!("Received {} peers over pex", message.added.len());
                    for entry in message.added {
                        self.swarm.add(entry.addr, PeerSource::Pex);
                    }
                }
                Err(e) => tracing::warn!("Failed to parse pex message: {e}"),
            },
            _ => {}
        }
    }

    fn on_ut_metadata(
        &mut self,
        conn_id: ConnId,
        payload: Bytes,
        ctx: &mut TorrentCtx<'_>,
    ) -> anyhow::Result<()> {
        let message = UtMessage::from_bytes(&payload)?;
        match message {
            UtMessage::Request { piece } => {
                let Some(conn) = self.conns.get_mut(&conn_id) else {
                    return Ok(());
                };
                let Some(remote_id) = conn
                    .extension_handshake
                    .as_ref()
                    .and_then(|h| h.ut_metadata_id())
                else {
                    return Ok(());
                };
                match self.metadata.as_ref().and_then(|m| m.get_block(piece)) {
                    Some(block) => {
                        let total_size = self.metadata.as_ref().unwrap().size;
                        let reply = UtMessage::Data { piece, total_size }.with_trailer(&block);
                        conn.send_extension(remote_id, reply, ctx.now);
                    }
                    None => {
                        let reply = UtMessage::Reject { piece };
                        conn.send_extension(remote_id, reply.as_bytes().into(), ctx.now);
                    }
                }
            }
            UtMessage::Data { piece, total_size } => {
                if self.has_metadata() {
                    return Ok(());
                }
                let Some(metadata) = &mut self.metadata else {
                    return Ok(());
                };
                anyhow::ensure!(total_size == metadata.size, "metadata size changed");
                // the block trails the bencoded header
                let header_len = UtMessage::Data { piece, total_size }.as_bytes().len();
                let block = payload.slice(header_len.min(payload.len())..);
                metadata.save_block(piece, block);
                if metadata.is_full() {
                    self.finish_metadata_fetch(ctx);
                } else {
                    self.request_next_metadata_block(conn_id, ctx);
                }
            }
            UtMessage::Reject { piece } => {
                tracing::debug!(piece, "Peer rejected metadata request");
            }
        }
        Ok(())
    }

    /// Begin fetching the info dict from a freshly handshaked peer when
    /// we only know the magnet link
    fn start_metadata_fetch(&mut self, conn_id: ConnId, ctx: &mut TorrentCtx<'_>) {
        if self.has_metadata() {
            return;
        }
        if self.metadata.is_none() {
            let Some(conn) = self.conns.get(&conn_id) else {
                return;
            };
            let Some(handshake) = conn.extension_handshake.as_deref() else {
                return;
            };
            self.metadata = UtMetadata::empty_from_handshake(handshake);
        }
        self.request_next_metadata_block(conn_id, ctx);
    }

    fn request_next_metadata_block(&mut self, conn_id: ConnId, ctx: &mut TorrentCtx<'_>) {
        let Some(metadata) = &mut self.metadata else {
            return;
        };
        let Some(request) = metadata.request_next_block() else {
            return;
        };
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        let Some(remote_id) = conn
            .extension_handshake
            .as_ref()
            .and_then(|h| h.ut_metadata_id())
        else {
            return;
        };
        conn.send_extension(remote_id, request.as_bytes().into(), ctx.now);
    }

    fn finish_metadata_fetch(&mut self, ctx: &mut TorrentCtx<'_>) {
        let metadata = self.metadata.take().expect("fetch just finished");
        let raw = metadata.as_bytes();
        if crate::utils::sha1(&raw) != self.info_hash {
            tracing::warn!("Fetched metadata does not hash to the info hash, retrying");
            self.metadata = None;
            return;
        }
        match Info::from_bytes(&raw) {
            Ok(info) => {
                tracing::info!(name = %info.name, "Resolved metadata from peers");
                self.install_info(info, None, ctx.config.max_active_pieces);
                ctx.events
                    .push(EngineEvent::MetadataResolved(self.info_hash));
            }
            Err(e) => {
                tracing::error!("Fetched metadata does not decode: {e}");
                self.metadata = None;
            }
        }
    }

    /// A data block arrived; feed the piece manager and dispatch the
    /// verified write when the piece filled up
    fn on_block(&mut self, conn_id: ConnId, block: Block, data: Bytes, ctx: &mut TorrentCtx<'_>) {
        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        let from = conn.addr;
        self.total_downloaded += data.len() as u64;
        let Some(pieces) = &mut self.pieces else {
            return;
        };
        let receipt = pieces.on_block(from, block, data);
        match receipt {
            BlockReceipt::Progress => {}
            BlockReceipt::Duplicate { cancels } => self.send_cancels(cancels, ctx),
            BlockReceipt::PieceReady {
                bytes,
                contributors,
                cancels,
            } => {
                self.send_cancels(cancels, ctx);
                self.dispatch_piece_write(block.piece, bytes, contributors, ctx);
            }
            BlockReceipt::Unrequested => {
                tracing::trace!(%from, "Discarding block nobody asked for");
            }
        }
    }

    fn send_cancels(&mut self, cancels: Vec<(SocketAddr, Block)>, ctx: &mut TorrentCtx<'_>) {
        for (addr, block) in cancels {
            let Some(conn_id) = self.conn_by_addr.get(&addr) else {
                continue;
            };
            if let Some(conn) = self.conns.get_mut(conn_id) {
                conn.send_cancel(block.piece, block.offset, block.length, ctx.now);
            }
        }
    }

    /// Hand a filled piece buffer to the disk queue, split per file
    fn dispatch_piece_write(
        &mut self,
        piece: u32,
        bytes: Bytes,
        contributors: Vec<SocketAddr>,
        ctx: &mut TorrentCtx<'_>,
    ) {
        let pieces = self.pieces.as_ref().expect("piece manager exists");
        let expected_sha1 = *pieces
            .expected_hash(piece as usize)
            .expect("piece index is valid");
        let segments: Vec<Segment> = pieces
            .file_segments(&self.file_spans, piece as usize, &bytes)
            .into_iter()
            .map(|segment| Segment {
                path: segment.path.to_owned(),
                offset: segment.file_offset,
                data: segment.bytes,
            })
            .collect();
        let write = VerifiedWrite {
            root: self.root_key.clone(),
            segments,
            expected_sha1,
        };
        let completion = ctx.disk.queue_verified_write(write);
        self.pending_writes.push((piece, contributors, completion));
    }

    /// Poll verified-write completions queued in earlier ticks
    fn poll_pending_writes(&mut self, ctx: &mut TorrentCtx<'_>) {
        let mut finished = Vec::new();
        let mut index = 0;
        while index < self.pending_writes.len() {
            match self.pending_writes[index].2.try_recv() {
                Ok(outcome) => {
                    let (piece, contributors, _) = self.pending_writes.swap_remove(index);
                    finished.push((piece, contributors, outcome));
                }
                Err(oneshot::error::TryRecvError::Empty) => index += 1,
                Err(oneshot::error::TryRecvError::Closed) => {
                    let (piece, _, _) = self.pending_writes.swap_remove(index);
                    tracing::error!(piece, "Disk queue dropped a write completion");
                }
            }
        }
        for (piece, contributors, outcome) in finished {
            self.on_write_outcome(piece, contributors, outcome, ctx);
        }
    }

    fn on_write_outcome(
        &mut self,
        piece: u32,
        contributors: Vec<SocketAddr>,
        outcome: WriteOutcome,
        ctx: &mut TorrentCtx<'_>,
    ) {
        let Some(pieces) = &mut self.pieces else {
            return;
        };
        match outcome {
            WriteOutcome::Success { .. } => {
                pieces.on_piece_verified(piece as usize);
                ctx.events.push(EngineEvent::PieceComplete {
                    info_hash: self.info_hash,
                    piece,
                });
                // announce to everyone who does not have it
                for conn in self.conns.values_mut() {
                    if conn.is_ready() && !conn.peer_has(piece as usize) {
                        conn.send_have(piece, ctx.now);
                    }
                }
                if pieces.is_finished() {
                    self.completed_at = Some(ctx.now_wall_ms);
                    ctx.events
                        .push(EngineEvent::TorrentComplete(self.info_hash));
                }
            }
            WriteOutcome::HashMismatch => {
                tracing::warn!(piece, "Piece failed verification, resetting");
                pieces.on_piece_failed(piece as usize, ctx.now);
                ctx.events.push(EngineEvent::PieceInvalid {
                    info_hash: self.info_hash,
                    piece,
                });
                let banned = self.swarm.record_corruption(&contributors);
                for addr in banned {
                    tracing::warn!(%addr, "Banning peer for repeated corruption");
                    if let Some(conn_id) = self.conn_by_addr.get(&addr) {
                        if let Some(conn) = self.conns.get_mut(conn_id) {
                            conn.close(CloseReason::Banned);
                        }
                    }
                }
            }
            WriteOutcome::IoError(message) => {
                tracing::error!(piece, "Disk write failed: {message}");
                pieces.on_piece_failed(piece as usize, ctx.now);
                // a failing disk pauses the torrent instead of spinning
                self.user_state = UserState::Paused;
                self.error = Some(Error::new(ErrorKind::DiskIoError, message));
                ctx.events.push(EngineEvent::TorrentError {
                    info_hash: self.info_hash,
                    kind: ErrorKind::DiskIoError,
                });
            }
            WriteOutcome::InvalidArgs => {
                tracing::error!(piece, "Disk queue rejected the write");
                pieces.on_piece_failed(piece as usize, ctx.now);
            }
        }
    }

    /// Answer an upload request, from cache or through a disk read
    fn serve_block(&mut self, conn_id: ConnId, block: Block, ctx: &mut TorrentCtx<'_>) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if conn.am_choking || !conn.peer_interested {
            return;
        }
        let Some(pieces) = &self.pieces else {
            return;
        };
        if !pieces.bitfield.has(block.piece as usize)
            || block.offset as u64 + block.length as u64
                > pieces.piece_size(block.piece as usize) as u64
        {
            return;
        }
        if let Some(cached) = self.piece_cache.get(&block.piece) {
            let data = cached.slice(block.range());
            self.total_uploaded += data.len() as u64;
            conn.send_piece(block.piece, block.offset, data, ctx.now);
            return;
        }

        // read the whole piece back from its file segments
        let segments: Vec<(PathBuf, u64, usize)> = pieces
            .file_ranges(&self.file_spans, block.piece as usize)
            .into_iter()
            .map(|(path, offset, len)| (path.to_owned(), offset, len))
            .collect();
        let fs = ctx.fs.clone();
        let root = self.root_key.clone();
        let (reply, response) = oneshot::channel();
        ctx.task_tracker.spawn(async move {
            let mut piece_bytes = Vec::new();
            for (path, offset, len) in segments {
                match fs.read_at(&root, &path, offset, len).await {
                    Ok(bytes) => piece_bytes.extend_from_slice(&bytes),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                }
            }
            let _ = reply.send(Ok(Bytes::from(piece_bytes)));
        });
        self.pending_reads.push((conn_id, block, response));
    }

    fn poll_pending_reads(&mut self, ctx: &mut TorrentCtx<'_>) {
        let mut ready = Vec::new();
        let mut index = 0;
        while index < self.pending_reads.len() {
            match self.pending_reads[index].2.try_recv() {
                Ok(result) => {
                    let (conn_id, block, _) = self.pending_reads.swap_remove(index);
                    ready.push((conn_id, block, result));
                }
                Err(oneshot::error::TryRecvError::Empty) => index += 1,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.pending_reads.swap_remove(index);
                }
            }
        }
        for (conn_id, block, result) in ready {
            match result {
                Ok(piece_bytes) => {
                    self.piece_cache.put(block.piece, piece_bytes.clone());
                    if let Some(conn) = self.conns.get_mut(&conn_id) {
                        if conn.is_ready() && !conn.am_choking {
                            let data = piece_bytes.slice(block.range());
                            self.total_uploaded += data.len() as u64;
                            conn.send_piece(block.piece, block.offset, data, ctx.now);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(piece = block.piece, "Upload read failed: {e}");
                }
            }
        }
    }

    /// Remove a finished connection and return whether it was a quick
    /// disconnect
    pub fn on_conn_closed(
        &mut self,
        conn_id: ConnId,
        reason: CloseReason,
        ctx: &mut TorrentCtx<'_>,
    ) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return;
        };
        // a duplicate connection for an address must not touch the
        // bookkeeping of the one that won
        if self.conn_by_addr.get(&conn.addr) != Some(&conn_id) {
            return;
        }
        self.conn_by_addr.remove(&conn.addr);
        let was_quick = conn.is_quick_disconnect(ctx.now);
        self.swarm.mark_disconnected(conn.addr, reason, was_quick);
        if let (Some(pieces), Some(bitfield)) = (&mut self.pieces, &conn.bitfield) {
            pieces.picker.peer_left(bitfield);
            pieces.release_peer(conn.addr);
        }
        if self.optimistic_slot == Some(conn.addr) {
            self.optimistic_slot = None;
        }
        self.pex_history
            .push_value(PexHistoryEntry::dropped(conn.addr));
        tracing::debug!(addr = %conn.addr, ?reason, "Peer connection closed");
    }

    /// Per-tick work: timers, chokes, request scheduling, maintenance
    pub fn tick(&mut self, ctx: &mut TorrentCtx<'_>) -> Vec<SocketAddr> {
        self.poll_pending_writes(ctx);
        self.poll_pending_reads(ctx);

        if self.user_state == UserState::Paused {
            return Vec::new();
        }

        // tracker announces on their own cadence
        let completed_now = self.is_complete();
        let stat = self.download_stat();
        let new_peers = self.trackers.tick(
            ctx.now,
            stat,
            completed_now,
            ctx.task_tracker,
            ctx.cancellation_token,
        );
        for addr in new_peers {
            self.swarm.add(addr, PeerSource::Tracker);
        }

        self.review_chokes(ctx);
        self.schedule_requests(ctx);
        self.send_pex_updates(ctx);

        if let Some(pieces) = &mut self.pieces {
            for reaped in pieces.reap_stalled(ctx.now, STALLED_PIECE_DEADLINE) {
                tracing::debug!(piece = reaped, "Dropped stalled piece");
            }
        }

        // connection budget for this torrent; the engine applies the
        // global limit on top
        let target = ctx.config.target_peers_per_torrent;
        let connecting_or_connected = self.conns.len();
        let mut dials = Vec::new();
        if connecting_or_connected < target {
            for _ in 0..target - connecting_or_connected {
                let Some(addr) = self.swarm.next_candidate(ctx.now) else {
                    break;
                };
                dials.push(addr);
            }
        }
        dials
    }

    /// Every ~10s: unchoke the peers that feed us best (or that we feed
    /// best while seeding), plus one optimistic slot rotated every 30s
    fn review_chokes(&mut self, ctx: &mut TorrentCtx<'_>) {
        if ctx.now.saturating_sub(self.last_choke_review) < CHOKE_REVIEW_INTERVAL {
            return;
        }
        self.last_choke_review = ctx.now;
        let seeding = self.is_complete();

        if ctx.now.saturating_sub(self.last_optimistic_rotate) >= OPTIMISTIC_ROTATE_INTERVAL {
            self.last_optimistic_rotate = ctx.now;
            // rotate to a random choked and interested peer
            let candidates: Vec<SocketAddr> = self
                .conns
                .values()
                .filter(|c| c.is_ready() && c.am_choking && c.peer_interested)
                .map(|c| c.addr)
                .collect();
            self.optimistic_slot = if candidates.is_empty() {
                None
            } else {
                let pick = ctx.entropy.random_u32() as usize % candidates.len();
                Some(candidates[pick])
            };
        }

        let mut ranked: Vec<(SocketAddr, u64)> = self
            .conns
            .values()
            .filter(|c| c.is_ready() && c.peer_interested)
            .map(|c| {
                let rate = if seeding {
                    c.rate.avg_up()
                } else {
                    c.rate.avg_down()
                };
                (c.addr, rate)
            })
            .collect();
        ranked.sort_by_key(|(_, rate)| std::cmp::Reverse(*rate));
        let unchoked: Vec<SocketAddr> = ranked
            .iter()
            .take(UNCHOKE_SLOTS)
            .map(|(addr, _)| *addr)
            .chain(self.optimistic_slot)
            .collect();

        for conn in self.conns.values_mut() {
            if !conn.is_ready() {
                continue;
            }
            if unchoked.contains(&conn.addr) {
                conn.send_unchoke(ctx.now);
            } else {
                conn.send_choke(ctx.now);
            }
        }
    }

    /// Keep every unchoked peer's request pipeline at its target depth
    fn schedule_requests(&mut self, ctx: &mut TorrentCtx<'_>) {
        let Some(pieces) = &mut self.pieces else {
            return;
        };
        for conn in self.conns.values_mut() {
            if !conn.is_ready() {
                continue;
            }
            let Some(peer_bitfield) = conn.bitfield.clone() else {
                continue;
            };

            // interest tracks whether the peer has anything we want
            let wants_something = pieces.peer_is_interesting(&peer_bitfield);
            if wants_something {
                conn.send_interested(ctx.now);
            } else {
                conn.send_not_interested(ctx.now);
            }

            if conn.peer_choking {
                continue;
            }
            let rate = conn.rate.down_speed_sec(ctx.config.tick_interval());
            let window = pipeline_depth(
                rate,
                crate::piece::BLOCK_SIZE,
                ctx.config.pipeline_depth_min,
                ctx.config.pipeline_depth_max,
            );
            while conn.inflight.len() < window {
                let Some(block) = pieces.next_request(conn.addr, &peer_bitfield, ctx.now) else {
                    break;
                };
                let accepted = conn.send_request(
                    BlockRequest {
                        index: block.piece,
                        begin: block.offset,
                        length: block.length,
                        endgame: pieces.is_endgame(),
                    },
                    ctx.now,
                );
                if !accepted {
                    break;
                }
            }
        }
    }

    /// Periodic pex deltas per peer, with history compaction
    fn send_pex_updates(&mut self, ctx: &mut TorrentCtx<'_>) {
        let mut min_tip = usize::MAX;
        for conn in self.conns.values_mut() {
            if !conn.is_ready() {
                continue;
            }
            let Some(pex_id) = conn
                .extension_handshake
                .as_ref()
                .and_then(|h| h.pex_id())
            else {
                continue;
            };
            if ctx.now.saturating_sub(conn.last_pex_at) >= PEX_MESSAGE_INTERVAL {
                let message = self.pex_history.pex_message(conn.pex_tip);
                if !message.added.is_empty() || !message.dropped.is_empty() {
                    conn.send_extension(pex_id, message.as_bytes().into(), ctx.now);
                }
                conn.last_pex_at = ctx.now;
                conn.pex_tip = self.pex_history.tip();
            }
            min_tip = min_tip.min(conn.pex_tip);
        }
        if min_tip != usize::MAX
            && min_tip > 0
            && self.pex_history.tip().saturating_sub(min_tip) > PEX_HISTORY_CLEANUP_THRESHOLD
        {
            tracing::debug!(min_tip, "Shrinking pex history");
            self.pex_history.shrink(min_tip);
            for conn in self.conns.values_mut() {
                conn.pex_tip -= min_tip;
            }
        }
    }

    /// Sweep connection timeouts and already-closed connections, returns
    /// everything that must be torn down
    pub fn reap_conn_timeouts(&mut self, now: Duration, idle: Duration) -> Vec<(ConnId, CloseReason)> {
        let mut dead = Vec::new();
        for (conn_id, conn) in self.conns.iter_mut() {
            if let Some(reason) = conn.close_reason() {
                dead.push((*conn_id, reason));
            } else if let Some(reason) = conn.on_tick(now, idle) {
                dead.push((*conn_id, reason));
            }
        }
        dead
    }

    pub fn sample_rates(&mut self) {
        for conn in self.conns.values_mut() {
            conn.sample_rate();
        }
    }

    /// Disconnect everything, e.g. on pause or shutdown
    pub fn close_all_conns(&mut self, reason: CloseReason) -> Vec<ConnId> {
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for conn in self.conns.values_mut() {
            conn.close(reason);
        }
        ids
    }

    pub fn bitfield_hex(&self) -> String {
        self.pieces
            .as_ref()
            .map(|p| p.bitfield.to_hex())
            .unwrap_or_default()
    }
}
