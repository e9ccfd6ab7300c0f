use std::{
    collections::HashMap,
    fmt::Display,
    net::SocketAddr,
    ops::Range,
    time::Duration,
};

use bytes::{Bytes, BytesMut};

use crate::{
    bitfield::BitField,
    metainfo::{Hashes, Info},
    picker::{PiecePicker, Priority},
    utils,
};

pub const BLOCK_SIZE: u32 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl Block {
    pub fn range(&self) -> Range<usize> {
        let offset = self.offset as usize;
        offset..offset + self.length as usize
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block in piece {} with offset {} and length {}",
            self.piece, self.offset, self.length
        )
    }
}

/// A piece being assembled from blocks
#[derive(Debug)]
pub struct ActivePiece {
    pub index: u32,
    length: u32,
    buffer: BytesMut,
    block_count: usize,
    received: BitField,
    /// Peers each block is currently requested from. More than one entry
    /// per block only happens in endgame.
    requested: Vec<Vec<SocketAddr>>,
    /// Everyone who delivered at least one block, for corruption tallies
    pub contributors: Vec<SocketAddr>,
    pub started_at: Duration,
}

impl ActivePiece {
    fn new(index: u32, length: u32, now: Duration) -> Self {
        let block_count = length.div_ceil(BLOCK_SIZE) as usize;
        Self {
            index,
            length,
            buffer: BytesMut::zeroed(length as usize),
            block_count,
            received: BitField::empty(block_count),
            requested: vec![Vec::new(); block_count],
            contributors: Vec::new(),
            started_at: now,
        }
    }

    fn block_at(&self, block_i: usize) -> Block {
        let offset = block_i as u32 * BLOCK_SIZE;
        Block {
            piece: self.index,
            offset,
            length: utils::block_size(offset, BLOCK_SIZE, self.length),
        }
    }

    fn is_saturated(&self) -> bool {
        (0..self.block_count).all(|i| self.received.has(i) || !self.requested[i].is_empty())
    }

    fn received_all(&self) -> bool {
        self.received.count() == self.block_count
    }

    pub fn missing_blocks(&self) -> usize {
        self.block_count - self.received.count()
    }
}

/// What happened to a delivered block
#[derive(Debug)]
pub enum BlockReceipt {
    Progress,
    /// Every block arrived; the buffer is ready for hashing.
    /// `cancels` are outstanding endgame duplicates to call off.
    PieceReady {
        bytes: Bytes,
        contributors: Vec<SocketAddr>,
        cancels: Vec<(SocketAddr, Block)>,
    },
    /// Block was already received, common under endgame. The sender is
    /// not penalised. `cancels` still lists duplicate assignments.
    Duplicate {
        cancels: Vec<(SocketAddr, Block)>,
    },
    /// Not a block we asked for
    Unrequested,
}

/// Decides which block to request from which peer, assembles pieces and
/// hands completed buffers to the disk layer for hash and write.
#[derive(Debug)]
pub struct PieceManager {
    piece_length: u32,
    total_length: u64,
    hashes: Hashes,
    /// Completed, verified pieces
    pub bitfield: BitField,
    pub picker: PiecePicker,
    active: HashMap<u32, ActivePiece>,
    max_active_pieces: usize,
    endgame: bool,
    endgame_threshold: Duration,
    started_at: Option<Duration>,
}

impl PieceManager {
    pub fn new(info: &Info, bitfield: BitField, max_active_pieces: usize) -> Self {
        let pieces_amount = info.pieces_amount();
        debug_assert!(bitfield.validate(pieces_amount).is_ok());
        Self {
            piece_length: info.piece_length,
            total_length: info.total_size(),
            hashes: info.pieces.clone(),
            bitfield,
            picker: PiecePicker::new(pieces_amount),
            active: HashMap::new(),
            max_active_pieces,
            endgame: false,
            endgame_threshold: Duration::from_secs(30),
            started_at: None,
        }
    }

    pub fn pieces_amount(&self) -> usize {
        self.hashes.len()
    }

    pub fn piece_size(&self, piece: usize) -> u32 {
        utils::piece_size(piece, self.piece_length, self.total_length)
    }

    pub fn expected_hash(&self, piece: usize) -> Option<&[u8; 20]> {
        self.hashes.get_hash(piece)
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    pub fn set_endgame_threshold(&mut self, threshold: Duration) {
        self.endgame_threshold = threshold;
    }

    pub fn is_finished(&self) -> bool {
        self.bitfield.count() == self.pieces_amount()
    }

    pub fn downloaded_amount(&self) -> u64 {
        self.bitfield
            .pieces()
            .map(|piece| self.piece_size(piece) as u64)
            .sum()
    }

    pub fn left_amount(&self) -> u64 {
        self.total_length - self.downloaded_amount()
    }

    pub fn active_amount(&self) -> usize {
        self.active.len()
    }

    /// Apply file priorities as per piece priorities. A piece shared by a
    /// skipped and a wanted file stays wanted.
    pub fn apply_file_priorities(&mut self, files: &[(Range<u64>, Priority)]) {
        let mut priorities = vec![Priority::Skip; self.pieces_amount()];
        for (piece, slot) in priorities.iter_mut().enumerate() {
            let piece_start = piece as u64 * self.piece_length as u64;
            let piece_end = piece_start + self.piece_size(piece) as u64;
            for (span, priority) in files {
                if span.start >= piece_end || span.end <= piece_start {
                    continue;
                }
                if priority.rank() > slot.rank() {
                    *slot = *priority;
                }
            }
        }
        self.picker.set_priorities(priorities);
    }

    /// Pull the next block to request from this peer, or nothing when the
    /// peer cannot help right now
    pub fn next_request(
        &mut self,
        peer: SocketAddr,
        peer_bitfield: &BitField,
        now: Duration,
    ) -> Option<Block> {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }

        // fill partially requested active pieces first
        for piece in self.active.values_mut() {
            if !peer_bitfield.has(piece.index as usize) {
                continue;
            }
            for block_i in 0..piece.block_count {
                if piece.received.has(block_i) || !piece.requested[block_i].is_empty() {
                    continue;
                }
                piece.requested[block_i].push(peer);
                return Some(piece.block_at(block_i));
            }
        }

        // open a new piece
        if self.active.len() < self.max_active_pieces {
            let taken =
                |piece: usize| self.bitfield.has(piece) || self.active.contains_key(&(piece as u32));
            if let Some(picked) = self.picker.pick(peer_bitfield, taken) {
                let length = self.piece_size(picked);
                let mut piece = ActivePiece::new(picked as u32, length, now);
                piece.requested[0].push(peer);
                let block = piece.block_at(0);
                self.active.insert(picked as u32, piece);
                return Some(block);
            }
        }

        self.maybe_enter_endgame(now);
        if self.endgame {
            return self.next_endgame_request(peer, peer_bitfield);
        }
        None
    }

    /// Endgame activates once every missing block is requested somewhere
    /// and the download has been running for a while
    fn maybe_enter_endgame(&mut self, now: Duration) {
        if self.endgame {
            return;
        }
        let missing = self.pieces_amount() - self.bitfield.count();
        if missing == 0 {
            return;
        }
        let all_requested = self.active.values().all(|p| p.is_saturated());
        let unstarted = missing - self.active.len();
        let ran_long_enough = self
            .started_at
            .is_some_and(|started| now.saturating_sub(started) >= self.endgame_threshold);
        if unstarted == 0 && all_requested && ran_long_enough {
            tracing::info!("Entering endgame mode with {missing} missing pieces");
            self.endgame = true;
        }
    }

    fn next_endgame_request(
        &mut self,
        peer: SocketAddr,
        peer_bitfield: &BitField,
    ) -> Option<Block> {
        // duplicate the least requested outstanding block
        let mut best: Option<(u32, usize, usize)> = None;
        for piece in self.active.values() {
            if !peer_bitfield.has(piece.index as usize) {
                continue;
            }
            for block_i in 0..piece.block_count {
                if piece.received.has(block_i) {
                    continue;
                }
                let requesters = &piece.requested[block_i];
                if requesters.iter().any(|addr| *addr == peer) {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((_, _, best_requesters)) => requesters.len() < best_requesters,
                };
                if better {
                    best = Some((piece.index, block_i, requesters.len()));
                }
            }
        }
        let (piece_i, block_i, _) = best?;
        let piece = self.active.get_mut(&piece_i).expect("picked from active");
        piece.requested[block_i].push(peer);
        Some(piece.block_at(block_i))
    }

    /// A block arrived from the wire
    pub fn on_block(&mut self, from: SocketAddr, block: Block, data: Bytes) -> BlockReceipt {
        let Some(piece) = self.active.get_mut(&block.piece) else {
            return BlockReceipt::Unrequested;
        };
        if block.offset % BLOCK_SIZE != 0 || data.len() != block.length as usize {
            return BlockReceipt::Unrequested;
        }
        let block_i = (block.offset / BLOCK_SIZE) as usize;
        if block_i >= piece.block_count || piece.block_at(block_i).length != block.length {
            return BlockReceipt::Unrequested;
        }

        if piece.received.has(block_i) {
            let cancels = Self::drain_cancels(piece, block_i, &from);
            return BlockReceipt::Duplicate { cancels };
        }

        piece.received.add(block_i).expect("block index in range");
        piece.buffer[block.range()].copy_from_slice(&data);
        if !piece.contributors.contains(&from) {
            piece.contributors.push(from);
        }
        let cancels = Self::drain_cancels(piece, block_i, &from);

        if piece.received_all() {
            let piece = self.active.remove(&block.piece).expect("piece is active");
            if self.active.is_empty() {
                self.endgame = false;
            }
            return BlockReceipt::PieceReady {
                bytes: piece.buffer.freeze(),
                contributors: piece.contributors,
                cancels,
            };
        }
        BlockReceipt::Progress
    }

    /// Everyone else who still has this block in flight must get a CANCEL
    fn drain_cancels(
        piece: &mut ActivePiece,
        block_i: usize,
        winner: &SocketAddr,
    ) -> Vec<(SocketAddr, Block)> {
        let block = piece.block_at(block_i);
        piece.requested[block_i]
            .drain(..)
            .filter(|addr| addr != winner)
            .map(|addr| (addr, block))
            .collect()
    }

    /// The disk layer confirmed the piece hash; mark it done
    pub fn on_piece_verified(&mut self, piece: usize) {
        if let Err(e) = self.bitfield.add(piece) {
            tracing::error!("Verified piece is out of bounds: {e}");
        }
    }

    /// Hash mismatch: throw the buffer away and put the piece back into
    /// the selection pool. Returns the peers that fed it.
    pub fn on_piece_failed(&mut self, piece: usize, now: Duration) -> Vec<SocketAddr> {
        // the failed piece is usually already removed when it went to disk
        let contributors = match self.active.remove(&(piece as u32)) {
            Some(active) => active.contributors,
            None => Vec::new(),
        };
        debug_assert!(!self.bitfield.has(piece));
        let _ = now;
        contributors
    }

    /// Forget every in-flight assignment of this peer so other peers can
    /// pick the blocks up. Keeps received data.
    pub fn release_peer(&mut self, peer: SocketAddr) {
        for piece in self.active.values_mut() {
            for requesters in &mut piece.requested {
                requesters.retain(|addr| *addr != peer);
            }
        }
    }

    /// Drop stalled active pieces whose deadline has long passed while no
    /// block arrived; their blocks go back into the pool
    pub fn reap_stalled(&mut self, now: Duration, deadline: Duration) -> Vec<u32> {
        let mut reaped = Vec::new();
        self.active.retain(|index, piece| {
            let stalled = piece.received.count() == 0
                && piece.requested.iter().all(|r| r.is_empty())
                && now.saturating_sub(piece.started_at) > deadline;
            if stalled {
                reaped.push(*index);
            }
            !stalled
        });
        reaped
    }

    /// Does the peer own any piece we still want
    pub fn peer_is_interesting(&self, peer_bitfield: &BitField) -> bool {
        self.bitfield
            .missing_pieces(self.pieces_amount())
            .any(|piece| !self.picker.priority(piece).is_skip() && peer_bitfield.has(piece))
    }

    /// File ranges a piece covers, without touching the payload
    pub fn file_ranges<'a>(
        &self,
        files: &'a [(Range<u64>, std::path::PathBuf)],
        piece: usize,
    ) -> Vec<(&'a std::path::Path, u64, usize)> {
        let piece_start = piece as u64 * self.piece_length as u64;
        let piece_end = piece_start + self.piece_size(piece) as u64;
        let mut ranges = Vec::new();
        for (span, path) in files {
            if span.start >= piece_end || span.end <= piece_start || span.start == span.end {
                continue;
            }
            let from = span.start.max(piece_start);
            let to = span.end.min(piece_end);
            ranges.push((path.as_path(), from - span.start, (to - from) as usize));
        }
        ranges
    }

    /// Split a verified piece into per file segments
    pub fn file_segments<'a>(
        &self,
        files: &'a [(Range<u64>, std::path::PathBuf)],
        piece: usize,
        bytes: &Bytes,
    ) -> Vec<FileSegment<'a>> {
        let piece_start = piece as u64 * self.piece_length as u64;
        let piece_end = piece_start + bytes.len() as u64;
        let mut segments = Vec::new();
        for (span, path) in files {
            if span.start >= piece_end || span.end <= piece_start {
                continue;
            }
            // zero length files never produce writes
            if span.start == span.end {
                continue;
            }
            let from = span.start.max(piece_start);
            let to = span.end.min(piece_end);
            segments.push(FileSegment {
                path,
                file_offset: from - span.start,
                bytes: bytes.slice((from - piece_start) as usize..(to - piece_start) as usize),
            });
        }
        segments
    }
}

#[derive(Debug, PartialEq)]
pub struct FileSegment<'a> {
    pub path: &'a std::path::Path,
    pub file_offset: u64,
    pub bytes: Bytes,
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use bytes::Bytes;

    use crate::{
        bitfield::BitField,
        metainfo::{Hashes, Info, SizeDescriptor},
        picker::Priority,
    };

    use super::{Block, BlockReceipt, PieceManager, BLOCK_SIZE};

    const NOW: Duration = Duration::from_secs(10);

    fn test_info(pieces: usize, piece_length: u32, total: u64) -> Info {
        Info {
            raw: Bytes::new(),
            file_descriptor: SizeDescriptor::Length(total),
            name: "test.bin".into(),
            piece_length,
            pieces: Hashes(std::iter::repeat([0u8; 20]).take(pieces).collect()),
        }
    }

    fn peer(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:6881").parse().unwrap()
    }

    fn seeder_bitfield(pieces: usize) -> BitField {
        let mut bf = BitField::empty(pieces);
        for i in 0..pieces {
            bf.add(i).unwrap();
        }
        bf
    }

    fn manager(pieces: usize, piece_length: u32, total: u64) -> PieceManager {
        let info = test_info(pieces, piece_length, total);
        let empty = BitField::empty(pieces);
        let mut manager = PieceManager::new(&info, empty, 8);
        manager.picker.peer_joined(&seeder_bitfield(pieces));
        manager
    }

    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn two_block_piece_reassembles() {
        // piece length 32768 means exactly two blocks
        let mut manager = manager(1, 2 * BLOCK_SIZE, 2 * BLOCK_SIZE as u64);
        let bf = seeder_bitfield(1);
        let first = manager.next_request(peer(1), &bf, NOW).unwrap();
        assert_eq!(
            first,
            Block {
                piece: 0,
                offset: 0,
                length: BLOCK_SIZE
            }
        );
        let second = manager.next_request(peer(1), &bf, NOW).unwrap();
        assert_eq!(second.offset, BLOCK_SIZE);
        // nothing else to hand out
        assert!(manager.next_request(peer(1), &bf, NOW).is_none());

        let data0 = Bytes::from(vec![1u8; BLOCK_SIZE as usize]);
        let data1 = Bytes::from(vec![2u8; BLOCK_SIZE as usize]);
        assert!(matches!(
            manager.on_block(peer(1), first, data0.clone()),
            BlockReceipt::Progress
        ));
        match manager.on_block(peer(1), second, data1.clone()) {
            BlockReceipt::PieceReady {
                bytes,
                contributors,
                cancels,
            } => {
                assert_eq!(&bytes[..BLOCK_SIZE as usize], &data0[..]);
                assert_eq!(&bytes[BLOCK_SIZE as usize..], &data1[..]);
                assert_eq!(contributors, vec![peer(1)]);
                assert!(cancels.is_empty());
            }
            other => panic!("expected PieceReady, got {other:?}"),
        }
        manager.on_piece_verified(0);
        assert!(manager.is_finished());
    }

    #[test]
    fn last_block_of_last_piece_is_short() {
        let total = BLOCK_SIZE as u64 + 100;
        let mut manager = manager(1, 2 * BLOCK_SIZE, total);
        let bf = seeder_bitfield(1);
        let first = manager.next_request(peer(1), &bf, NOW).unwrap();
        assert_eq!(first.length, BLOCK_SIZE);
        let last = manager.next_request(peer(1), &bf, NOW).unwrap();
        assert_eq!(last.length, 100);
    }

    #[test]
    fn failed_piece_reenters_pool_with_contributors() {
        let mut manager = manager(1, BLOCK_SIZE, BLOCK_SIZE as u64);
        let bf = seeder_bitfield(1);
        let block = manager.next_request(peer(1), &bf, NOW).unwrap();
        let BlockReceipt::PieceReady { contributors, .. } =
            manager.on_block(peer(1), block, Bytes::from(vec![9u8; BLOCK_SIZE as usize]))
        else {
            panic!("expected ready piece");
        };
        assert_eq!(contributors, vec![peer(1)]);

        // disk says the hash does not match
        let blamed = manager.on_piece_failed(0, NOW);
        // piece was already out of active, contributors came from the ready event
        assert!(blamed.is_empty());
        assert!(!manager.bitfield.has(0));
        // piece is requestable again
        assert!(manager.next_request(peer(2), &bf, NOW).is_some());
    }

    #[test]
    fn duplicate_block_is_not_penalised() {
        let mut manager = manager(2, BLOCK_SIZE, 2 * BLOCK_SIZE as u64);
        let bf = seeder_bitfield(2);
        let block = manager.next_request(peer(1), &bf, NOW).unwrap();
        assert!(matches!(
            manager.on_block(peer(1), block, Bytes::from(vec![1u8; BLOCK_SIZE as usize])),
            BlockReceipt::PieceReady { .. }
        ));
        assert!(matches!(
            manager.on_block(peer(2), block, Bytes::from(vec![1u8; BLOCK_SIZE as usize])),
            BlockReceipt::Unrequested
        ));
    }

    #[test]
    fn choked_peer_blocks_are_reassigned() {
        let mut manager = manager(1, 2 * BLOCK_SIZE, 2 * BLOCK_SIZE as u64);
        let bf = seeder_bitfield(1);
        let block = manager.next_request(peer(1), &bf, NOW).unwrap();
        manager.release_peer(peer(1));
        let reassigned = manager.next_request(peer(2), &bf, NOW).unwrap();
        assert_eq!(block, reassigned);
    }

    #[test]
    #[traced_test]
    fn endgame_duplicates_and_cancels() {
        let mut manager = manager(1, BLOCK_SIZE, BLOCK_SIZE as u64);
        manager.endgame_threshold = Duration::ZERO;
        let bf = seeder_bitfield(1);
        let block = manager.next_request(peer(1), &bf, NOW).unwrap();
        // every block requested and nothing unstarted: endgame kicks in
        // and the same block goes out to a second peer
        let dup = manager
            .next_request(peer(2), &bf, NOW + Duration::from_secs(1))
            .unwrap();
        assert_eq!(block, dup);
        assert!(manager.is_endgame());
        // same peer does not get the same block twice
        assert!(manager
            .next_request(peer(2), &bf, NOW + Duration::from_secs(1))
            .is_none());

        // first delivery wins, the loser gets cancelled
        match manager.on_block(peer(2), block, Bytes::from(vec![1u8; BLOCK_SIZE as usize])) {
            BlockReceipt::PieceReady { cancels, .. } => {
                assert_eq!(cancels, vec![(peer(1), block)]);
            }
            other => panic!("expected PieceReady, got {other:?}"),
        }
        // endgame ends with the last active piece
        assert!(!manager.is_endgame());
    }

    #[test]
    fn file_priorities_map_to_pieces() {
        let mut manager = manager(4, BLOCK_SIZE, 4 * BLOCK_SIZE as u64);
        let block = BLOCK_SIZE as u64;
        // file A covers pieces 0-1, file B covers 1-2, file C covers 3
        manager.apply_file_priorities(&[
            (0..block + 10, Priority::Skip),
            (block + 10..3 * block, Priority::Normal),
            (3 * block..4 * block, Priority::High),
        ]);
        assert_eq!(manager.picker.priority(0), Priority::Skip);
        // boundary piece shared with a wanted file stays wanted
        assert_eq!(manager.picker.priority(1), Priority::Normal);
        assert_eq!(manager.picker.priority(2), Priority::Normal);
        assert_eq!(manager.picker.priority(3), Priority::High);
    }

    #[test]
    fn file_segments_split_spanning_piece() {
        let manager = manager(2, BLOCK_SIZE, 2 * BLOCK_SIZE as u64);
        let files = vec![
            (0..100u64, std::path::PathBuf::from("a.bin")),
            (100..100, std::path::PathBuf::from("empty.bin")),
            (100..2 * BLOCK_SIZE as u64, std::path::PathBuf::from("b.bin")),
        ];
        let bytes = Bytes::from(vec![5u8; BLOCK_SIZE as usize]);
        let segments = manager.file_segments(&files, 0, &bytes);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].path, std::path::Path::new("a.bin"));
        assert_eq!(segments[0].file_offset, 0);
        assert_eq!(segments[0].bytes.len(), 100);
        assert_eq!(segments[1].path, std::path::Path::new("b.bin"));
        assert_eq!(segments[1].file_offset, 0);
        assert_eq!(segments[1].bytes.len(), BLOCK_SIZE as usize - 100);

        // second piece lands inside b only, with a file offset
        let segments = manager.file_segments(&files, 1, &bytes);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].file_offset, BLOCK_SIZE as u64 - 100);
    }
}
