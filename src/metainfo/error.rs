use thiserror::Error;

use crate::bencode::BencodeError;

/// Errors from parsing or building torrent files.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("piece count mismatch: declared {declared}, expected {expected}")]
    PieceCountMismatch { declared: u64, expected: u64 },

    #[error("no files to build from")]
    NoFiles,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
