use crate::bitfield::BitField;

/// File download priority, applied to pieces at scheduling time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Priority {
    #[default]
    Normal = 0,
    Skip = 1,
    High = 2,
}

impl Priority {
    pub fn is_skip(&self) -> bool {
        *self == Priority::Skip
    }

    /// Scheduling preference; the wire values (Normal=0, Skip=1, High=2)
    /// do not sort usefully on their own
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Skip => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }
}

impl TryFrom<usize> for Priority {
    type Error = anyhow::Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Skip),
            2 => Ok(Self::High),
            _ => Err(anyhow::anyhow!("expected value in range 0..3, got {value}")),
        }
    }
}

/// Rarest first piece selection with a priority overlay. Availability is
/// a per piece counter fed by BITFIELD and HAVE messages.
#[derive(Debug)]
pub struct PiecePicker {
    availability: Vec<u32>,
    priorities: Vec<Priority>,
}

impl PiecePicker {
    pub fn new(pieces_amount: usize) -> Self {
        Self {
            availability: vec![0; pieces_amount],
            priorities: vec![Priority::default(); pieces_amount],
        }
    }

    pub fn pieces_amount(&self) -> usize {
        self.availability.len()
    }

    pub fn set_priorities(&mut self, priorities: Vec<Priority>) {
        debug_assert_eq!(priorities.len(), self.availability.len());
        self.priorities = priorities;
    }

    pub fn priority(&self, piece: usize) -> Priority {
        self.priorities
            .get(piece)
            .copied()
            .unwrap_or_default()
    }

    pub fn availability(&self, piece: usize) -> u32 {
        self.availability.get(piece).copied().unwrap_or(0)
    }

    /// Peer announced its whole bitfield
    pub fn peer_joined(&mut self, bitfield: &BitField) {
        for piece in bitfield.pieces() {
            if let Some(counter) = self.availability.get_mut(piece) {
                *counter += 1;
            }
        }
    }

    /// Peer went away; undo its bitfield contribution
    pub fn peer_left(&mut self, bitfield: &BitField) {
        for piece in bitfield.pieces() {
            if let Some(counter) = self.availability.get_mut(piece) {
                *counter = counter.saturating_sub(1);
            }
        }
    }

    /// Peer announced one more piece (HAVE)
    pub fn peer_has(&mut self, piece: usize) {
        if let Some(counter) = self.availability.get_mut(piece) {
            *counter += 1;
        }
    }

    /// Choose the next piece to start downloading from `peer_bitfield`.
    /// `taken` excludes pieces that are complete or already active.
    /// High priority wins over rarity; skipped pieces never come back
    /// from here.
    pub fn pick(
        &self,
        peer_bitfield: &BitField,
        taken: impl Fn(usize) -> bool,
    ) -> Option<usize> {
        let mut best: Option<(usize, Priority, u32)> = None;
        for piece in 0..self.availability.len() {
            if self.priorities[piece].is_skip() || taken(piece) || !peer_bitfield.has(piece) {
                continue;
            }
            let priority = self.priorities[piece];
            let availability = self.availability[piece];
            let better = match best {
                None => true,
                Some((_, best_priority, best_availability)) => {
                    // higher priority first, then lower availability,
                    // ties break on index which the scan order gives us
                    priority.rank() > best_priority.rank()
                        || (priority == best_priority && availability < best_availability)
                }
            };
            if better {
                best = Some((piece, priority, availability));
            }
        }
        best.map(|(piece, _, _)| piece)
    }
}

#[cfg(test)]
mod tests {
    use crate::bitfield::BitField;

    use super::{PiecePicker, Priority};

    fn full_bitfield(pieces: usize) -> BitField {
        let mut bf = BitField::empty(pieces);
        for piece in 0..pieces {
            bf.add(piece).unwrap();
        }
        bf
    }

    #[test]
    fn rarest_piece_wins() {
        let mut picker = PiecePicker::new(4);
        let mut seeder = full_bitfield(4);
        picker.peer_joined(&seeder);
        picker.peer_joined(&seeder);
        // third peer misses piece 2, making 2 the rarest for it
        seeder.remove(2).unwrap();
        picker.peer_joined(&seeder);

        assert_eq!(picker.availability(0), 3);
        assert_eq!(picker.availability(2), 2);
        let picked = picker.pick(&full_bitfield(4), |_| false);
        assert_eq!(picked, Some(2));
    }

    #[test]
    fn availability_ties_break_on_index() {
        let mut picker = PiecePicker::new(3);
        picker.peer_joined(&full_bitfield(3));
        assert_eq!(picker.pick(&full_bitfield(3), |_| false), Some(0));
        assert_eq!(picker.pick(&full_bitfield(3), |p| p == 0), Some(1));
    }

    #[test]
    fn have_updates_availability() {
        let mut picker = PiecePicker::new(3);
        picker.peer_joined(&full_bitfield(3));
        picker.peer_has(0);
        picker.peer_has(1);
        assert_eq!(picker.pick(&full_bitfield(3), |_| false), Some(2));
        let gone = full_bitfield(3);
        picker.peer_left(&gone);
        assert_eq!(picker.availability(2), 0);
    }

    #[test]
    fn skip_priority_excludes_high_promotes() {
        let mut picker = PiecePicker::new(4);
        let seeder = full_bitfield(4);
        picker.peer_joined(&seeder);
        picker.peer_has(3);
        picker.set_priorities(vec![
            Priority::Normal,
            Priority::Skip,
            Priority::Normal,
            Priority::High,
        ]);
        // 3 is the most available but high priority overrides rarity
        assert_eq!(picker.pick(&seeder, |_| false), Some(3));
        // skipped pieces never show up
        assert_eq!(picker.pick(&seeder, |p| p == 3 || p == 0), Some(2));
        assert_eq!(picker.pick(&seeder, |p| p != 1), None);
    }

    #[test]
    fn peer_without_pieces_yields_nothing() {
        let mut picker = PiecePicker::new(4);
        picker.peer_joined(&full_bitfield(4));
        assert_eq!(picker.pick(&BitField::empty(4), |_| false), None);
    }
}
