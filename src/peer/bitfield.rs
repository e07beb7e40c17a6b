use bytes::Bytes;

/// A per-connection piece bitfield.
///
/// One bit per piece, numbered from the high bit of the first byte.
/// Each connection carries one for the remote side; the session carries
/// one for itself, whose popcount only ever increases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Parses a raw wire bitfield.
    ///
    /// Returns `None` when the length is wrong or a spare bit past the
    /// last piece is set; both are protocol violations.
    pub fn from_wire(bytes: &Bytes, piece_count: usize) -> Option<Self> {
        if bytes.len() != piece_count.div_ceil(8) {
            return None;
        }

        let bf = Self {
            bits: bytes.to_vec(),
            piece_count,
        };

        for spare in piece_count..bf.bits.len() * 8 {
            if bf.bit(spare) {
                return None;
            }
        }

        Some(bf)
    }

    /// A bitfield with every piece set.
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        let spare = bf.bits.len() * 8 - piece_count;
        if spare > 0 {
            let last = bf.bits.len() - 1;
            bf.bits[last] &= 0xFFu8 << spare;
        }
        bf
    }

    fn bit(&self, index: usize) -> bool {
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn has(&self, index: usize) -> bool {
        index < self.piece_count && self.bit(index)
    }

    pub fn set(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    /// Number of pieces present.
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

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Iterates over the indices of set pieces.
    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| self.bit(i))
    }

    /// True if this bitfield has any piece the other one lacks.
    pub fn has_piece_missing_from(&self, other: &Bitfield) -> bool {
        self.pieces().any(|i| !other.has(i))
    }
}
