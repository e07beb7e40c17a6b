//! riptide - a BitTorrent file-distribution engine
//!
//! This library implements the BitTorrent wire protocol over TCP with
//! HTTP tracker discovery: rarest-first piece selection, adaptive request
//! scheduling with an endgame phase, choke/unchoke fairness, on-disk
//! piece verification with resume support, and upload bandwidth shaping.
//!
//! # Modules
//!
//! - [`bencode`] - Bencode encoding/decoding
//! - [`metainfo`] - Torrent metainfo parsing and creation
//! - [`peer`] - Peer wire protocol, connection state, choking
//! - [`picker`] - Rarest-first piece selection
//! - [`storage`] - Disk I/O, piece verification, resume state
//! - [`rate`] - Upload bandwidth shaping
//! - [`tracker`] - HTTP tracker protocol and multi-tier announces
//! - [`session`] - The per-download engine driving everything

pub mod bencode;
pub mod config;
pub mod metainfo;
pub mod peer;
pub mod picker;
pub mod rate;
pub mod session;
pub mod storage;
pub mod tracker;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::SessionConfig;
pub use metainfo::{FileRecord, Metainfo, MetainfoBuilder, MetainfoError};
pub use peer::{
    Bitfield, BlockRequest, Choker, Handshake, Message, PeerConnection, PeerError, PeerId,
};
pub use picker::{FilePriority, PiecePicker};
pub use rate::{UploadLimiter, UploadTuner};
pub use session::{Session, SessionCommand, SessionError, SessionEvent};
pub use storage::{PieceStore, ResumeData, StorageError};
pub use tracker::{
    AnnounceResponse, AnnounceTransport, ScrapeEntry, TrackerClient, TrackerError, TrackerEvent,
};
