use bytes::Bytes;

/// Length of the piece with consideration of the shorter last piece
pub fn piece_size(piece_i: usize, piece_length: u32, total_length: u64) -> u32 {
    let piece_length = piece_length as u64;
    let total_pieces = total_length.div_ceil(piece_length);
    if piece_i as u64 == total_pieces - 1 {
        let md = total_length % piece_length;
        if md == 0 {
            piece_length as u32
        } else {
            md as u32
        }
    } else {
        piece_length as u32
    }
}

/// Length of the block with consideration of the shorter last block
pub fn block_size(offset: u32, block_length: u32, piece_length: u32) -> u32 {
    std::cmp::min(block_length, piece_length - offset)
}

pub fn sha1(input: &[u8]) -> [u8; 20] {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(input);
    hasher.finalize().into()
}

pub fn verify_sha1(hash: [u8; 20], input: &Bytes) -> bool {
    sha1(input) == hash
}

/// Sha1 over scattered buffers, used when a piece is still split in blocks
pub fn verify_iter_sha1<'a>(hash: &[u8; 20], input: impl Iterator<Item = &'a Bytes>) -> bool {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    for chunk in input {
        hasher.update(chunk);
    }
    let result: [u8; 20] = hasher.finalize().into();
    *hash == result
}
