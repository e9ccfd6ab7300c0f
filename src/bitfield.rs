use anyhow::Context;

/// Compact piece ownership vector as it appears in the wire BITFIELD message.
/// Bit 0 of byte 0 (the high bit) is piece 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField(pub Vec<u8>);

impl BitField {
    pub fn new(data: &[u8]) -> Self {
        Self(data.to_vec())
    }

    pub fn empty(pieces_amount: usize) -> Self {
        Self(vec![0; std::cmp::max(pieces_amount.div_ceil(8), 1)])
    }

    pub fn has(&self, piece: usize) -> bool {
        let bytes = &self.0;
        let Some(block) = bytes.get(piece / 8) else {
            return false;
        };
        let position = (piece % 8) as u32;

        block & 1u8.rotate_right(position + 1) != 0
    }

    pub fn add(&mut self, piece: usize) -> anyhow::Result<()> {
        let bytes = &mut self.0;
        let Some(block) = bytes.get_mut(piece / 8) else {
            return Err(anyhow::anyhow!("piece {piece} does not exist"));
        };
        let position = (piece % 8) as u32;
        *block |= 1u8.rotate_right(position + 1);
        Ok(())
    }

    pub fn remove(&mut self, piece: usize) -> anyhow::Result<()> {
        let bytes = &mut self.0;
        let Some(block) = bytes.get_mut(piece / 8) else {
            return Err(anyhow::anyhow!("piece {piece} does not exist"));
        };
        let position = (piece % 8) as u32;
        *block &= !1u8.rotate_right(position + 1);
        Ok(())
    }

    /// Amount of set pieces
    pub fn count(&self) -> usize {
        self.0.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    pub fn is_full(&self, max_pieces: usize) -> bool {
        self.count() == max_pieces
    }

    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(i, byte)| {
            (0..8).filter_map(move |position| {
                let piece_i = i * 8 + (position as usize);
                let mask = 1u8.rotate_right(position + 1);
                (byte & mask != 0).then_some(piece_i)
            })
        })
    }

    pub fn missing_pieces(&self, total_pieces: usize) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(move |(i, byte)| {
            (0..8).filter_map(move |position| {
                let piece_i = i * 8 + (position as usize);
                if piece_i >= total_pieces {
                    return None;
                }
                let mask = 1u8.rotate_right(position + 1);
                (byte & mask == 0).then_some(piece_i)
            })
        })
    }

    /// Make sure that bitfield is appropriate for given pieces amount.
    /// Fails if there are any 1's after the end or it is small or large to fit given pieces.
    pub fn validate(&self, total_pieces: usize) -> anyhow::Result<()> {
        let bitfield_pieces = self.0.len() * 8;
        let leftover = bitfield_pieces
            .checked_sub(total_pieces)
            .context("bitfield has less capacity than needed")?;
        if leftover >= 8 {
            anyhow::bail!("bitfield is larger than needed")
        }
        for piece in (bitfield_pieces - leftover)..bitfield_pieces {
            anyhow::ensure!(!self.has(piece));
        }
        Ok(())
    }

    /// Perform bitwise | with other
    pub fn union(&mut self, other: &Self) {
        for (self_byte, other_byte) in self.0.iter_mut().zip(&other.0) {
            *self_byte |= other_byte;
        }
    }

    /// Perform bitwise & with other
    pub fn intersection(&mut self, other: &Self) {
        for (self_byte, other_byte) in self.0.iter_mut().zip(&other.0) {
            *self_byte &= other_byte;
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(hex_str: &str) -> anyhow::Result<Self> {
        Ok(Self(hex::decode(hex_str).context("decode bitfield hex")?))
    }
}

impl From<Vec<u8>> for BitField {
    fn from(value: Vec<u8>) -> Self {
        BitField(value)
    }
}

#[cfg(test)]
mod tests {

    use super::BitField;

    #[test]
    fn bitfield_has() {
        let data = [0b01110101, 0b01110001];
        let bitfield = BitField::new(&data);
        assert!(!bitfield.has(0));
        assert!(bitfield.has(1));
        assert!(bitfield.has(2));
        assert!(bitfield.has(3));
        assert!(!bitfield.has(4));
        assert!(bitfield.has(5));
        assert!(!bitfield.has(6));
        assert!(bitfield.has(7));
        assert!(!bitfield.has(8));
        assert!(bitfield.has(9));
        assert!(bitfield.has(10));
        assert!(bitfield.has(11));
        assert!(!bitfield.has(12));
        assert!(!bitfield.has(13));
        assert!(!bitfield.has(14));
        assert!(bitfield.has(15));
        assert!(!bitfield.has(16));
        assert!(!bitfield.has(17));
    }

    #[test]
    fn bitfield_add_remove() {
        let data = [0b01110101, 0b01110001];
        let mut bitfield = BitField::new(&data);
        bitfield.add(0).unwrap();
        bitfield.add(4).unwrap();
        bitfield.add(14).unwrap();
        assert!(bitfield.has(0));
        assert!(bitfield.has(4));
        assert!(bitfield.has(14));
        assert!(bitfield.add(16).is_err());
        bitfield.remove(0).unwrap();
        bitfield.remove(14).unwrap();
        assert!(!bitfield.has(0));
        assert!(!bitfield.has(14));
        assert!(bitfield.remove(16).is_err());
    }

    #[test]
    fn bitfield_count() {
        let data = [0b01110101, 0b01110001];
        let mut bitfield = BitField::new(&data);
        assert_eq!(bitfield.count(), 9);
        bitfield.add(0).unwrap();
        assert_eq!(bitfield.count(), 10);
        assert!(!bitfield.is_full(16));
        for piece in 0..16 {
            bitfield.add(piece).unwrap();
        }
        assert!(bitfield.is_full(16));
    }

    #[test]
    fn bitfield_iterator() {
        let data = [0b01110101, 0b01110001];
        let bitfield = BitField::new(&data);
        let pieces: Vec<_> = bitfield.pieces().collect();
        assert_eq!(pieces, [1, 2, 3, 5, 7, 9, 10, 11, 15]);
        let missing: Vec<_> = bitfield.missing_pieces(16).collect();
        assert_eq!(missing, [0, 4, 6, 8, 12, 13, 14]);
    }

    #[test]
    fn bitfield_validate() {
        let data = [0b01110101, 0b01110001, 0b00100000];
        let bitfield = BitField::new(&data);
        assert!(bitfield.validate(16).is_err());
        assert!(bitfield.validate(18).is_err());
        assert!(bitfield.validate(19).is_ok());
        assert!(bitfield.validate(24).is_ok());
        assert!(bitfield.validate(25).is_err());
        let data = [0b11111111, 0b00000000];
        let bitfield = BitField::new(&data);
        assert!(bitfield.validate(7).is_err());
        assert!(bitfield.validate(8).is_err());
        assert!(bitfield.validate(9).is_ok());
    }

    #[test]
    fn bitfield_set_ops() {
        let mut a = BitField::new(&[0b11001100]);
        let b = BitField::new(&[0b10101010]);
        a.union(&b);
        assert_eq!(a.0, [0b11101110]);
        let mut c = BitField::new(&[0b11001100]);
        c.intersection(&b);
        assert_eq!(c.0, [0b10001000]);
    }

    #[test]
    fn bitfield_hex_round_trip() {
        let bitfield = BitField::new(&[0b01110101, 0b01110001]);
        let restored = BitField::from_hex(&bitfield.to_hex()).unwrap();
        assert_eq!(bitfield, restored);
        assert!(BitField::from_hex("zz").is_err());
    }
}
