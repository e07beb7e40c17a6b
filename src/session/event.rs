use crate::peer::{BlockRequest, Message, PeerError, PeerId};
use crate::picker::FilePriority;
use crate::storage::ResumeData;
use crate::tracker::{AnnounceResponse, TrackerError};
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};

/// Control surface of a running session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Dial a peer directly, outside tracker discovery.
    AddPeer(SocketAddr),
    /// Change a file's download priority; takes effect for pieces not
    /// yet started.
    SetFilePriority {
        file_index: usize,
        priority: FilePriority,
    },
    /// Replace the upload cap in bytes per second. Zero is unlimited.
    SetUploadLimit(u64),
    /// Request a resume snapshot of current progress.
    ResumeSnapshot(oneshot::Sender<ResumeData>),
    Shutdown,
}

/// What a session reports to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// Periodic progress summary.
    Progress {
        verified: u32,
        total: u32,
        downloaded: u64,
        uploaded: u64,
        /// Current aggregate receive rate in bytes per second.
        download_rate: f64,
        /// Current aggregate send rate in bytes per second.
        upload_rate: f64,
        peers: usize,
        endgame: bool,
    },
    PieceVerified { piece: u32 },
    /// A piece failed its hash and will be re-downloaded.
    PieceFailed { piece: u32 },
    /// Every piece is verified; the session keeps seeding.
    Completed,
    PeerConnected(SocketAddr),
    PeerDisconnected(SocketAddr),
    /// Snapshot the host should persist for later resume. Emitted after
    /// each verified piece and at shutdown.
    Resume(ResumeData),
    /// A tracker round failed; the session retries on its own.
    TrackerProblem(String),
    /// Unrecoverable, typically a disk error. The session stops.
    Fatal(String),
}

/// Everything that flows into the engine task from its helper tasks.
pub(super) enum Internal {
    Connected {
        addr: SocketAddr,
        peer_id: PeerId,
        outgoing: mpsc::Sender<Message>,
    },
    PeerMessage {
        addr: SocketAddr,
        message: Message,
    },
    /// A serve task finished sending a block.
    Served {
        addr: SocketAddr,
        request: BlockRequest,
        bytes: usize,
    },
    ServeFailed {
        addr: SocketAddr,
        request: BlockRequest,
    },
    Closed {
        addr: SocketAddr,
        reason: Option<PeerError>,
    },
    DialFailed {
        addr: SocketAddr,
    },
    Announce(Result<AnnounceResponse, TrackerError>),
}
