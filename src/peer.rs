//! Peer wire protocol.
//!
//! This module implements the BitTorrent peer wire protocol over TCP:
//! the 68-byte handshake, length-prefixed message framing, per-connection
//! state (choke/interest in both directions, bitfields, outstanding
//! requests, rate measurement), and the choking algorithm that allocates
//! upload slots.

mod bitfield;
mod choking;
mod connection;
mod error;
mod message;
mod peer_id;
mod transport;

pub use bitfield::Bitfield;
pub use choking::{ChokeDecision, ChokeView, Choker, SuperSeeder};
pub use connection::{BlockRequest, PeerConnection, RateMeter};
pub use error::PeerError;
pub use message::{Handshake, Message, HANDSHAKE_LEN};
pub use peer_id::PeerId;
pub use transport::{connect_and_handshake, FrameReader, FrameWriter, PeerTransport};

#[cfg(test)]
mod tests;
