use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("invalid block range: piece {piece}, offset {offset}, length {length}")]
    InvalidBlockRange { piece: u32, offset: u32, length: u32 },

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),

    #[error("resume data: {0}")]
    Resume(#[from] crate::bencode::BencodeError),

    #[error("invalid resume data: {0}")]
    InvalidResume(&'static str),
}
