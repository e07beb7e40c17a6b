//! Rarest-first piece selection.
//!
//! Every piece we do not yet have sits in a bucket keyed by
//! `availability + priority_step * file_priority_tier`, where
//! availability is how many connected peers have the piece. Buckets are
//! scanned from the lowest key up, so high-priority and rare pieces go
//! first; within a bucket selection is uniformly random to avoid every
//! downloader in the swarm converging on the same globally-rarest piece.
//!
//! Until `rarest_first_cutoff` pieces are verified the picker instead
//! takes any piece the asking peer can fulfill, which diversifies early
//! block acquisition (a brand-new downloader has nothing to trade, so
//! getting *any* complete piece quickly matters more than rarity).
//!
//! `have`/`bitfield` arrivals update bucket membership incrementally,
//! one O(log buckets) move per affected piece, never a full rescan.

use crate::peer::{Bitfield, BlockRequest};
use rand::prelude::IndexedRandom as _;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Per-file download priority, translated into picker bucket space.
/// Disabled files never get picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilePriority {
    Disabled,
    Low,
    #[default]
    Normal,
    High,
}

impl FilePriority {
    /// Bucket tier: lower tiers are scanned first.
    fn tier(self) -> Option<u64> {
        match self {
            FilePriority::High => Some(0),
            FilePriority::Normal => Some(1),
            FilePriority::Low => Some(2),
            FilePriority::Disabled => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Waiting in a bucket.
    Pending,
    /// Some blocks handed out or received.
    Active,
    Verified,
    Disabled,
}

#[derive(Debug)]
struct PieceState {
    availability: u64,
    tier: Option<u64>,
    status: Status,
}

#[derive(Debug)]
struct ActivePiece {
    /// Blocks nobody has been asked for yet.
    unrequested: Vec<BlockRequest>,
    /// Blocks handed out and not yet received back.
    outstanding: HashSet<BlockRequest>,
    received: usize,
    total_blocks: usize,
}

/// Rarest-first piece picker with priority tiers.
pub struct PiecePicker {
    piece_length: u64,
    total_length: u64,
    block_size: u32,
    priority_step: u64,
    rarest_first_cutoff: u32,
    states: Vec<PieceState>,
    buckets: BTreeMap<u64, Vec<u32>>,
    active: HashMap<u32, ActivePiece>,
    verified_count: u32,
}

impl PiecePicker {
    pub fn new(
        piece_count: u32,
        piece_length: u64,
        total_length: u64,
        block_size: u32,
        priority_step: u64,
        rarest_first_cutoff: u32,
    ) -> Self {
        let mut picker = Self {
            piece_length,
            total_length,
            block_size,
            priority_step,
            rarest_first_cutoff,
            states: Vec::with_capacity(piece_count as usize),
            buckets: BTreeMap::new(),
            active: HashMap::new(),
            verified_count: 0,
        };

        for piece in 0..piece_count {
            picker.states.push(PieceState {
                availability: 0,
                tier: Some(1),
                status: Status::Pending,
            });
            picker.bucket_insert(piece);
        }

        picker
    }

    pub fn piece_count(&self) -> u32 {
        self.states.len() as u32
    }

    pub fn verified_count(&self) -> u32 {
        self.verified_count
    }

    /// True once every non-disabled piece is verified.
    pub fn is_complete(&self) -> bool {
        self.states
            .iter()
            .all(|s| matches!(s.status, Status::Verified | Status::Disabled))
    }

    /// Endgame: every remaining block is already requested from someone,
    /// yet the download is not finished.
    pub fn is_endgame(&self) -> bool {
        !self.is_complete()
            && self.buckets.is_empty()
            && self.active.values().all(|a| a.unrequested.is_empty())
    }

    fn key(&self, piece: u32) -> Option<u64> {
        let state = &self.states[piece as usize];
        state.tier.map(|t| state.availability + self.priority_step * t)
    }

    fn bucket_insert(&mut self, piece: u32) {
        if let Some(key) = self.key(piece) {
            self.buckets.entry(key).or_default().push(piece);
        }
    }

    fn bucket_remove(&mut self, piece: u32) {
        if let Some(key) = self.key(piece) {
            if let Some(bucket) = self.buckets.get_mut(&key) {
                if let Some(pos) = bucket.iter().position(|&p| p == piece) {
                    bucket.swap_remove(pos);
                }
                if bucket.is_empty() {
                    self.buckets.remove(&key);
                }
            }
        }
    }

    /// A connected peer announced it has `piece`.
    ///
    /// Callers must de-duplicate per peer (the session checks the peer's
    /// bitfield first), so each peer contributes at most one count.
    pub fn peer_has(&mut self, piece: u32) {
        let pending = self.states[piece as usize].status == Status::Pending;
        if pending {
            self.bucket_remove(piece);
        }
        self.states[piece as usize].availability += 1;
        if pending {
            self.bucket_insert(piece);
        }
    }

    /// A peer connection went away; its availability contribution goes
    /// with it.
    pub fn peer_gone(&mut self, theirs: &Bitfield) {
        for piece in theirs.pieces() {
            let piece = piece as u32;
            let pending = self.states[piece as usize].status == Status::Pending;
            if pending {
                self.bucket_remove(piece);
            }
            let avail = &mut self.states[piece as usize].availability;
            *avail = avail.saturating_sub(1);
            if pending {
                self.bucket_insert(piece);
            }
        }
    }

    /// Applies a file priority to a contiguous piece range.
    pub fn set_priority(&mut self, pieces: std::ops::Range<u32>, priority: FilePriority) {
        for piece in pieces {
            let state = &self.states[piece as usize];
            if state.tier == priority.tier() {
                continue;
            }

            match state.status {
                Status::Pending => {
                    self.bucket_remove(piece);
                    self.states[piece as usize].tier = priority.tier();
                    if priority.tier().is_some() {
                        self.bucket_insert(piece);
                    } else {
                        self.states[piece as usize].status = Status::Disabled;
                    }
                }
                Status::Disabled => {
                    self.states[piece as usize].tier = priority.tier();
                    if priority.tier().is_some() {
                        self.states[piece as usize].status = Status::Pending;
                        self.bucket_insert(piece);
                    }
                }
                // Active and verified pieces keep going; priority only
                // affects what gets started next.
                Status::Active | Status::Verified => {
                    self.states[piece as usize].tier = priority.tier();
                }
            }
        }
    }

    /// Picks up to `budget` blocks this peer can supply.
    ///
    /// Blocks from already-active pieces come first so partial pieces
    /// finish before new ones start; each block is handed out exactly
    /// once, so outstanding requests always partition the unacquired
    /// ranges of a piece.
    pub fn pick(&mut self, theirs: &Bitfield, budget: usize) -> Vec<BlockRequest> {
        let mut picked = Vec::new();

        // Continue partial pieces the peer can help with.
        let mut continuable: Vec<u32> = self
            .active
            .iter()
            .filter(|(&piece, a)| theirs.has(piece as usize) && !a.unrequested.is_empty())
            .map(|(&piece, _)| piece)
            .collect();
        continuable.sort_unstable();

        for piece in continuable {
            self.take_blocks(piece, &mut picked, budget);
            if picked.len() >= budget {
                return picked;
            }
        }

        // Start fresh pieces.
        while picked.len() < budget {
            let Some(piece) = self.choose_pending(theirs) else {
                break;
            };
            self.activate(piece);
            self.take_blocks(piece, &mut picked, budget);
        }

        picked
    }

    fn choose_pending(&self, theirs: &Bitfield) -> Option<u32> {
        if self.verified_count < self.rarest_first_cutoff {
            // Early phase: any piece the peer can fulfill, chosen at
            // random across all buckets.
            let available: Vec<u32> = self
                .buckets
                .values()
                .flatten()
                .copied()
                .filter(|&p| theirs.has(p as usize))
                .collect();
            return available.choose(&mut rand::rng()).copied();
        }

        for bucket in self.buckets.values() {
            let available: Vec<u32> = bucket
                .iter()
                .copied()
                .filter(|&p| theirs.has(p as usize))
                .collect();
            if let Some(&piece) = available.choose(&mut rand::rng()) {
                return Some(piece);
            }
        }
        None
    }

    fn activate(&mut self, piece: u32) {
        self.bucket_remove(piece);
        self.states[piece as usize].status = Status::Active;

        let blocks = self.blocks_for(piece);
        self.active.insert(
            piece,
            ActivePiece {
                total_blocks: blocks.len(),
                unrequested: blocks,
                outstanding: HashSet::new(),
                received: 0,
            },
        );
    }

    fn take_blocks(&mut self, piece: u32, out: &mut Vec<BlockRequest>, budget: usize) {
        if let Some(active) = self.active.get_mut(&piece) {
            while out.len() < budget {
                let Some(block) = active.unrequested.pop() else {
                    break;
                };
                active.outstanding.insert(block);
                out.push(block);
            }
        }
    }

    /// Size of the piece at `index` (the last one may be short).
    pub fn piece_size(&self, piece: u32) -> u64 {
        let start = piece as u64 * self.piece_length;
        (self.total_length - start).min(self.piece_length)
    }

    fn blocks_for(&self, piece: u32) -> Vec<BlockRequest> {
        let piece_size = self.piece_size(piece);
        let mut blocks = Vec::new();
        let mut offset = 0u64;

        while offset < piece_size {
            let length = (piece_size - offset).min(self.block_size as u64) as u32;
            blocks.push(BlockRequest::new(piece, offset as u32, length));
            offset += length as u64;
        }

        // Popped from the back, so reverse for in-order requests.
        blocks.reverse();
        blocks
    }

    /// Reinstates a partially-downloaded piece from resume state:
    /// blocks fully covered by `ranges` count as received and are never
    /// re-requested.
    pub fn restore_partial(&mut self, piece: u32, ranges: &[(u32, u32)]) {
        if self.states[piece as usize].status != Status::Pending {
            return;
        }
        self.activate(piece);
        if let Some(active) = self.active.get_mut(&piece) {
            let before = active.unrequested.len();
            active.unrequested.retain(|b| {
                !ranges
                    .iter()
                    .any(|&(start, end)| start <= b.offset && b.offset + b.length <= end)
            });
            active.received += before - active.unrequested.len();
        }
    }

    /// Records an arrived block. Returns true when every block of the
    /// piece has now been received.
    pub fn block_received(&mut self, request: BlockRequest) -> bool {
        let Some(active) = self.active.get_mut(&request.piece) else {
            return false;
        };

        if !active.outstanding.remove(&request) {
            // Endgame duplicate that already arrived from someone else.
            return false;
        }

        active.received += 1;
        active.received == active.total_blocks
    }

    /// Returns blocks to the unrequested pool, e.g. when the connection
    /// owning them is destroyed or times out.
    pub fn release(&mut self, requests: impl IntoIterator<Item = BlockRequest>) {
        for request in requests {
            if let Some(active) = self.active.get_mut(&request.piece) {
                if active.outstanding.remove(&request) {
                    active.unrequested.push(request);
                }
            }
        }
    }

    /// Marks a piece verified; it never returns to the buckets.
    pub fn piece_verified(&mut self, piece: u32) {
        if self.states[piece as usize].status == Status::Verified {
            return;
        }
        self.active.remove(&piece);
        if self.states[piece as usize].status == Status::Pending {
            self.bucket_remove(piece);
        }
        self.states[piece as usize].status = Status::Verified;
        self.verified_count += 1;
    }

    /// Returns a hash-failed piece to the unrequested pool for a full
    /// retry.
    pub fn piece_failed(&mut self, piece: u32) {
        self.active.remove(&piece);
        self.states[piece as usize].status = Status::Pending;
        self.bucket_insert(piece);
    }

    /// Every outstanding request for `piece`, for endgame duplication
    /// and cancel fan-out.
    pub fn outstanding_for(&self, piece: u32) -> Vec<BlockRequest> {
        self.active
            .get(&piece)
            .map(|a| a.outstanding.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All outstanding requests across active pieces.
    pub fn all_outstanding(&self) -> Vec<BlockRequest> {
        self.active
            .values()
            .flat_map(|a| a.outstanding.iter().copied())
            .collect()
    }

    /// True if this peer has anything we still want.
    pub fn wants_from(&self, theirs: &Bitfield) -> bool {
        self.states.iter().enumerate().any(|(i, s)| {
            matches!(s.status, Status::Pending | Status::Active) && theirs.has(i)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picker(piece_count: u32) -> PiecePicker {
        // 4 blocks of 16 KiB per piece.
        PiecePicker::new(
            piece_count,
            65536,
            piece_count as u64 * 65536,
            16384,
            1_000_000,
            0, // strict rarest-first from the start unless stated
        )
    }

    fn bitfield_with(pieces: &[u32], count: usize) -> Bitfield {
        let mut bf = Bitfield::new(count);
        for &p in pieces {
            bf.set(p as usize);
        }
        bf
    }

    #[test]
    fn rarest_piece_wins() {
        let mut p = picker(4);
        // Piece 3 is on one peer, the others on three.
        for piece in 0..4 {
            p.peer_has(piece);
        }
        for piece in 0..3 {
            p.peer_has(piece);
            p.peer_has(piece);
        }

        let everything = Bitfield::full(4);
        let picked = p.pick(&everything, 1);
        assert_eq!(picked[0].piece, 3);
    }

    #[test]
    fn two_peers_covering_disjoint_halves() {
        let mut p = picker(4);
        let peer_a = bitfield_with(&[0, 1], 4);
        let peer_b = bitfield_with(&[2, 3], 4);

        for piece in [0u32, 1] {
            p.peer_has(piece);
        }
        for piece in [2u32, 3] {
            p.peer_has(piece);
        }

        // Never idle: each peer gets asked for a piece it actually has.
        let from_a = p.pick(&peer_a, 4);
        assert!(!from_a.is_empty());
        assert!(from_a.iter().all(|r| r.piece == 0 || r.piece == 1));

        let from_b = p.pick(&peer_b, 4);
        assert!(!from_b.is_empty());
        assert!(from_b.iter().all(|r| r.piece == 2 || r.piece == 3));
    }

    #[test]
    fn outstanding_requests_partition_the_piece() {
        let mut p = picker(1);
        p.peer_has(0);
        let everything = Bitfield::full(1);

        let first = p.pick(&everything, 2);
        let second = p.pick(&everything, 10);

        let mut all = first;
        all.extend(second);

        // No overlap, full coverage of the 64 KiB piece.
        let mut ranges: Vec<(u32, u32)> =
            all.iter().map(|r| (r.offset, r.offset + r.length)).collect();
        ranges.sort_unstable();
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges.first().unwrap().0, 0);
        assert_eq!(ranges.last().unwrap().1, 65536);
        for window in ranges.windows(2) {
            assert_eq!(window[0].1, window[1].0, "ranges must not overlap or gap");
        }

        // Nothing left to hand out.
        assert!(p.pick(&everything, 10).is_empty());
    }

    #[test]
    fn released_blocks_are_rerequestable() {
        let mut p = picker(1);
        p.peer_has(0);
        let everything = Bitfield::full(1);

        let picked = p.pick(&everything, 4);
        assert_eq!(picked.len(), 4);
        assert!(p.pick(&everything, 4).is_empty());

        p.release(picked.iter().copied().take(2));
        assert_eq!(p.pick(&everything, 4).len(), 2);
    }

    #[test]
    fn endgame_begins_when_nothing_is_unrequested() {
        let mut p = picker(2);
        p.peer_has(0);
        p.peer_has(1);
        let everything = Bitfield::full(2);

        assert!(!p.is_endgame());
        let picked = p.pick(&everything, 8);
        assert_eq!(picked.len(), 8);
        assert!(p.is_endgame());

        // Receiving everything ends the endgame via verification.
        for r in &picked {
            p.block_received(*r);
        }
        p.piece_verified(0);
        p.piece_verified(1);
        assert!(!p.is_endgame());
        assert!(p.is_complete());
    }

    #[test]
    fn failed_piece_is_requeued() {
        let mut p = picker(1);
        p.peer_has(0);
        let everything = Bitfield::full(1);

        for r in p.pick(&everything, 4) {
            p.block_received(r);
        }
        assert!(p.pick(&everything, 1).is_empty());

        p.piece_failed(0);
        // The whole piece is requestable again.
        assert_eq!(p.pick(&everything, 8).len(), 4);
    }

    #[test]
    fn disabled_pieces_are_never_picked() {
        let mut p = picker(2);
        p.peer_has(0);
        p.peer_has(1);
        p.set_priority(0..1, FilePriority::Disabled);

        let everything = Bitfield::full(2);
        let picked = p.pick(&everything, 16);
        assert!(picked.iter().all(|r| r.piece == 1));
    }

    #[test]
    fn high_priority_beats_rarity() {
        let mut p = picker(2);
        // Piece 0 is much rarer.
        p.peer_has(0);
        for _ in 0..5 {
            p.peer_has(1);
        }
        p.set_priority(1..2, FilePriority::High);

        let everything = Bitfield::full(2);
        let picked = p.pick(&everything, 1);
        assert_eq!(picked[0].piece, 1);
    }

    #[test]
    fn availability_updates_are_idempotent_via_caller_dedup() {
        // The session only reports a have once per peer; a duplicate
        // wire message must not reach the picker. Verify the bucket
        // state a single report produces is what selection sees.
        let mut p = picker(2);
        p.peer_has(0);
        p.peer_has(1);
        p.peer_has(1);

        let everything = Bitfield::full(2);
        // Piece 0 (availability 1) is rarer than piece 1 (availability 2).
        let picked = p.pick(&everything, 1);
        assert_eq!(picked[0].piece, 0);
    }

    #[test]
    fn random_first_phase_ignores_rarity() {
        let mut p = PiecePicker::new(4, 65536, 4 * 65536, 16384, 1_000_000, 4);
        for _ in 0..3 {
            p.peer_has(0);
        }
        p.peer_has(1);

        // Peer only has the common piece; random-first still serves it.
        let only_common = bitfield_with(&[0], 4);
        let picked = p.pick(&only_common, 1);
        assert_eq!(picked[0].piece, 0);
    }

    #[test]
    fn short_last_piece_blocks() {
        let p = PiecePicker::new(2, 65536, 65536 + 20000, 16384, 1_000_000, 0);
        assert_eq!(p.piece_size(0), 65536);
        assert_eq!(p.piece_size(1), 20000);

        let blocks = p.blocks_for(1);
        assert_eq!(blocks.len(), 2);
        let total: u64 = blocks.iter().map(|b| b.length as u64).sum();
        assert_eq!(total, 20000);
    }
}
