use thiserror::Error;

/// Errors on a single peer connection.
///
/// All of these are fatal to the connection they occur on and to nothing
/// else; the session drops the peer and keeps downloading.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("handshake not completed within grace period")]
    HandshakeTimeout,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("write timeout")]
    WriteTimeout,

    #[error("protocol violation: {0}")]
    Violation(&'static str),
}
