/// One bit per piece, most significant bit first within each byte.
///
/// Bits past `piece_count` in the final byte are always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Number of bytes needed to hold `piece_count` bits.
    pub fn byte_len(piece_count: usize) -> usize {
        piece_count.div_ceil(8)
    }

    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; Self::byte_len(piece_count)],
            piece_count,
        }
    }

    /// Wrap raw bytes, which must be exactly `byte_len(piece_count)` long.
    /// Spare trailing bits are cleared.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Option<Self> {
        if bytes.len() != Self::byte_len(piece_count) {
            return None;
        }
        let mut bitfield = Self {
            bits: bytes.to_vec(),
            piece_count,
        };
        bitfield.clear_spare_bits();
        Some(bitfield)
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Set bit `index`, returning false when it is out of range.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
        true
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Indices whose bit is clear.
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(move |&i| !self.has(i))
    }

    /// Whether `other` holds any piece this bitfield lacks.
    pub fn lacks_any_of(&self, other: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(ours, theirs)| theirs & !ours != 0)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xffu8 << spare;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first_layout() {
        let mut bitfield = Bitfield::new(10);
        assert_eq!(bitfield.as_bytes(), &[0, 0]);

        bitfield.set(0);
        bitfield.set(9);
        assert_eq!(bitfield.as_bytes(), &[0x80, 0x40]);
        assert!(bitfield.has(0));
        assert!(!bitfield.has(1));
        assert!(bitfield.has(9));
        assert_eq!(bitfield.count(), 2);
    }

    #[test]
    fn test_out_of_range() {
        let mut bitfield = Bitfield::new(10);
        assert!(!bitfield.set(10));
        assert!(!bitfield.has(10));
        assert_eq!(bitfield.count(), 0);
    }

    #[test]
    fn test_from_bytes_checks_length_and_clears_spare_bits() {
        assert!(Bitfield::from_bytes(&[0xff], 10).is_none());
        assert!(Bitfield::from_bytes(&[0xff, 0xff, 0x00], 10).is_none());

        let bitfield = Bitfield::from_bytes(&[0xff, 0xff], 10).unwrap();
        assert_eq!(bitfield.as_bytes(), &[0xff, 0xc0]);
        assert!(bitfield.is_complete());
    }

    #[test]
    fn test_missing_and_lacks_any_of() {
        let mut ours = Bitfield::new(4);
        ours.set(0);
        ours.set(2);
        assert_eq!(ours.missing().collect::<Vec<_>>(), vec![1, 3]);

        let mut theirs = Bitfield::new(4);
        theirs.set(2);
        assert!(!ours.lacks_any_of(&theirs));
        theirs.set(3);
        assert!(ours.lacks_any_of(&theirs));
    }
}
