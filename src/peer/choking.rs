use super::bitfield::Bitfield;
use rand::prelude::IndexedRandom as _;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

/// The view the choker needs of a connection.
///
/// Kept as a trait so the algorithm can be exercised in tests with stub
/// peers and so anything that can report rates can participate.
pub trait ChokeView {
    fn addr(&self) -> SocketAddr;
    fn peer_interested(&self) -> bool;
    fn am_choking(&self) -> bool;
    fn download_rate(&mut self) -> f64;
    fn upload_rate(&mut self) -> f64;
    fn is_snubbed(&self) -> bool;
}

/// One choke/unchoke flip to apply and send on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeDecision {
    pub addr: SocketAddr,
    pub unchoke: bool,
}

/// Upload slot allocation.
///
/// Interested peers are ranked by the download rate they deliver to us
/// (upload rate instead once we are seeding and have nothing to gain),
/// and the top `max_uploads` are unchoked. Peers quiet beyond the snub
/// window are excluded from the ranking so a fast-but-stalled peer
/// cannot hold a slot. One extra optimistic slot rotates to a random
/// peer outside the top set to discover better trading partners, so at
/// most `max_uploads + 1` peers are unchoked at once.
pub struct Choker {
    max_uploads: usize,
    optimistic: Option<SocketAddr>,
}

impl Choker {
    pub fn new(max_uploads: usize) -> Self {
        Self {
            max_uploads,
            optimistic: None,
        }
    }

    pub fn optimistic(&self) -> Option<SocketAddr> {
        self.optimistic
    }

    pub fn peer_gone(&mut self, addr: &SocketAddr) {
        if self.optimistic == Some(*addr) {
            self.optimistic = None;
        }
    }

    /// Recomputes the unchoked set and returns only the flips.
    ///
    /// `rotate_optimistic` is set by the session on its slower timer.
    pub fn rechoke<V: ChokeView>(
        &mut self,
        peers: &mut [&mut V],
        seeding: bool,
        rotate_optimistic: bool,
    ) -> Vec<ChokeDecision> {
        let mut ranked: Vec<(SocketAddr, f64)> = peers
            .iter_mut()
            .filter(|p| p.peer_interested() && !p.is_snubbed())
            .map(|p| {
                let rate = if seeding {
                    p.upload_rate()
                } else {
                    p.download_rate()
                };
                (p.addr(), rate)
            })
            .collect();

        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let winners: HashSet<SocketAddr> =
            ranked.iter().take(self.max_uploads).map(|(a, _)| *a).collect();

        let optimistic_stale = match self.optimistic {
            None => true,
            Some(addr) => {
                winners.contains(&addr) || !peers.iter().any(|p| p.addr() == addr)
            }
        };

        if rotate_optimistic || optimistic_stale {
            let outside: Vec<SocketAddr> = peers
                .iter()
                .filter(|p| p.peer_interested() && !winners.contains(&p.addr()))
                .map(|p| p.addr())
                .collect();
            self.optimistic = outside.choose(&mut rand::rng()).copied();
        }

        let mut decisions = Vec::new();
        for peer in peers.iter() {
            let addr = peer.addr();
            let unchoke = winners.contains(&addr) || self.optimistic == Some(addr);
            if unchoke == peer.am_choking() {
                decisions.push(ChokeDecision { addr, unchoke });
            }
        }

        decisions
    }
}

/// Super-seed bookkeeping.
///
/// In super-seed mode the session never reveals its full bitfield.
/// Each peer is handed one piece at a time via a `have` announcement and
/// gets the next only after that piece has been observed spreading,
/// which forces peers to redistribute among themselves instead of all
/// pulling from the seed.
#[derive(Debug, Default)]
pub struct SuperSeeder {
    assigned: HashMap<SocketAddr, u32>,
    spread: HashSet<u32>,
}

impl SuperSeeder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Piece currently revealed to `addr`, if any.
    pub fn assignment(&self, addr: &SocketAddr) -> Option<u32> {
        self.assigned.get(addr).copied()
    }

    /// Picks the next piece to reveal to `addr`: one we have, the peer
    /// lacks, nobody else is currently tasked with spreading, and that
    /// has not already been observed redistributing.
    pub fn next_assignment(
        &mut self,
        addr: SocketAddr,
        ours: &Bitfield,
        theirs: &Bitfield,
    ) -> Option<u32> {
        if self.assigned.contains_key(&addr) {
            return None;
        }

        let busy: HashSet<u32> = self.assigned.values().copied().collect();
        let piece = ours.pieces().map(|i| i as u32).find(|&i| {
            !theirs.has(i as usize) && !busy.contains(&i) && !self.spread.contains(&i)
        })?;

        self.assigned.insert(addr, piece);
        Some(piece)
    }

    /// Called when any peer announces `piece`. If that completes an
    /// assignment the assignee is freed for its next piece; returns the
    /// freed peer.
    pub fn piece_spread(&mut self, piece: u32) -> Option<SocketAddr> {
        let addr = self
            .assigned
            .iter()
            .find(|(_, &p)| p == piece)
            .map(|(a, _)| *a)?;
        self.assigned.remove(&addr);
        self.spread.insert(piece);
        Some(addr)
    }

    pub fn peer_gone(&mut self, addr: &SocketAddr) {
        self.assigned.remove(addr);
    }
}
