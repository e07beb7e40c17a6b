use super::bitfield::Bitfield;
use super::choking::ChokeView;
use super::message::Message;
use super::peer_id::PeerId;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const RATE_WINDOW: Duration = Duration::from_secs(5);

/// One in-flight block request: a sub-piece byte range.
///
/// Owned by exactly one connection's outstanding set, except in endgame
/// when the session deliberately duplicates it across peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }
}

/// Sliding-window throughput meter.
#[derive(Debug, Default)]
pub struct RateMeter {
    samples: VecDeque<(Instant, u64)>,
    windowed: u64,
}

impl RateMeter {
    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        self.windowed += bytes;
        self.prune(now);
    }

    /// Bytes per second over the sample window.
    pub fn rate(&mut self) -> f64 {
        self.prune(Instant::now());
        self.windowed as f64 / RATE_WINDOW.as_secs_f64()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.duration_since(at) <= RATE_WINDOW {
                break;
            }
            self.windowed -= bytes;
            self.samples.pop_front();
        }
    }
}

/// Session-side state for one connected peer.
///
/// Created after handshake completion; dropped on socket close or
/// protocol violation. The session releases its outstanding requests
/// back into the picker when it goes away.
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub peer_id: PeerId,
    /// Channel to this peer's writer task.
    outgoing: mpsc::Sender<Message>,

    // Four independent flags: two per direction.
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    /// What the remote side has.
    pub bitfield: Bitfield,
    /// Set once any message has arrived; a bitfield after that point is
    /// a protocol violation.
    pub saw_message: bool,
    /// Set once a bitfield arrived; a second one is a violation.
    pub saw_bitfield: bool,

    /// Blocks requested from this peer and not yet answered.
    pub requests: HashSet<BlockRequest>,

    pub connected_at: Instant,
    /// Last time any message arrived.
    pub last_receive: Instant,
    /// Last time piece payload arrived; drives snub detection.
    pub last_data: Instant,
    /// Last time we sent anything; drives keep-alives.
    pub last_send: Instant,
    /// Set when we unchoke this peer, cleared by its first request;
    /// the elapsed time is the rate tuner's congestion probe.
    pub unchoked_at: Option<Instant>,

    pub downloaded: u64,
    pub uploaded: u64,
    pub download_meter: RateMeter,
    pub upload_meter: RateMeter,

    /// Corrupt pieces attributed to this peer.
    pub hash_failures: u32,
    /// How the per-peer snub window is evaluated.
    pub snub_window: Duration,
}

impl PeerConnection {
    pub fn new(
        addr: SocketAddr,
        peer_id: PeerId,
        piece_count: usize,
        outgoing: mpsc::Sender<Message>,
        snub_window: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            addr,
            peer_id,
            outgoing,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: Bitfield::new(piece_count),
            saw_message: false,
            saw_bitfield: false,
            requests: HashSet::new(),
            connected_at: now,
            last_receive: now,
            last_data: now,
            last_send: now,
            unchoked_at: None,
            downloaded: 0,
            uploaded: 0,
            download_meter: RateMeter::default(),
            upload_meter: RateMeter::default(),
            hash_failures: 0,
            snub_window,
        }
    }

    /// Queues a message for the writer task without blocking the loop.
    ///
    /// A full queue means the peer is not draining its socket; treat it
    /// like a closed connection.
    pub fn send(&mut self, message: Message) -> Result<(), SendClosed> {
        self.outgoing.try_send(message).map_err(|_| SendClosed)?;
        self.last_send = Instant::now();
        Ok(())
    }

    /// Clone of the writer-task handle, for tasks that bypass the
    /// session loop (block serving).
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.outgoing.clone()
    }

    /// True when we may issue requests: they unchoked us and we want
    /// something they have.
    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.am_interested
    }

    /// A peer that has been quiet for longer than the snub window while
    /// we have requests pending.
    pub fn snubbed(&self) -> bool {
        !self.requests.is_empty() && self.last_data.elapsed() > self.snub_window
    }

    pub fn idle_for(&self) -> Duration {
        self.last_receive.elapsed().min(self.last_send.elapsed())
    }

    pub fn record_received(&mut self, payload_len: usize) {
        self.last_receive = Instant::now();
        if payload_len > 0 {
            self.last_data = self.last_receive;
            self.downloaded += payload_len as u64;
            self.download_meter.record(payload_len as u64);
        }
    }

    pub fn record_uploaded(&mut self, len: usize) {
        self.uploaded += len as u64;
        self.upload_meter.record(len as u64);
    }
}

/// The peer's outgoing queue is gone or jammed; close the connection.
#[derive(Debug)]
pub struct SendClosed;

impl ChokeView for PeerConnection {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    fn am_choking(&self) -> bool {
        self.am_choking
    }

    fn download_rate(&mut self) -> f64 {
        self.download_meter.rate()
    }

    fn upload_rate(&mut self) -> f64 {
        self.upload_meter.rate()
    }

    fn is_snubbed(&self) -> bool {
        self.snubbed()
    }
}
