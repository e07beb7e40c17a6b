use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

/// Tracks which byte ranges of each in-progress piece have reached disk
/// and which peers supplied them.
///
/// Block payloads are written straight to their final position, so this
/// holds no data, only coverage. The contributor set is what hash
/// failures get attributed to.
#[derive(Debug, Default)]
pub struct Assembler {
    pieces: HashMap<u32, PartialPiece>,
}

#[derive(Debug, Default)]
struct PartialPiece {
    /// Sorted, merged, non-overlapping `[start, end)` ranges.
    ranges: Vec<(u32, u32)>,
    contributors: HashSet<SocketAddr>,
}

impl PartialPiece {
    fn covered(&self) -> u64 {
        self.ranges.iter().map(|&(s, e)| (e - s) as u64).sum()
    }

    /// Merges `[start, end)` in; returns true if any new byte was added.
    fn insert(&mut self, start: u32, end: u32) -> bool {
        let before = self.covered();
        self.ranges.push((start, end));
        self.ranges.sort_unstable();

        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;

        self.covered() > before
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a block arrival. Returns true if the block added bytes
    /// that were not already present (endgame duplicates return false).
    pub fn record(&mut self, piece: u32, offset: u32, length: u32, from: SocketAddr) -> bool {
        let partial = self.pieces.entry(piece).or_default();
        partial.contributors.insert(from);
        partial.insert(offset, offset + length)
    }

    /// Bytes of `piece` present on disk.
    pub fn covered(&self, piece: u32) -> u64 {
        self.pieces.get(&piece).map(|p| p.covered()).unwrap_or(0)
    }

    pub fn is_complete(&self, piece: u32, piece_size: u64) -> bool {
        self.covered(piece) == piece_size
    }

    /// Peers that supplied any part of `piece`.
    pub fn contributors(&self, piece: u32) -> Vec<SocketAddr> {
        self.pieces
            .get(&piece)
            .map(|p| p.contributors.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops a piece's bookkeeping, after verification either way.
    pub fn clear(&mut self, piece: u32) {
        self.pieces.remove(&piece);
    }

    /// Coverage of every partial piece, for resume snapshots.
    pub fn partial_pieces(&self) -> impl Iterator<Item = (u32, &[(u32, u32)])> + '_ {
        self.pieces.iter().map(|(&p, s)| (p, s.ranges.as_slice()))
    }

    /// Reinstates coverage from a resume snapshot. Contributor history
    /// does not survive a restart.
    pub fn restore(&mut self, piece: u32, ranges: &[(u32, u32)]) {
        let partial = self.pieces.entry(piece).or_default();
        for &(start, end) in ranges {
            partial.insert(start, end);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}
