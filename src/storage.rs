//! Disk persistence and hash verification.
//!
//! The download target is a flat byte space: all files laid end to end
//! in torrent order. Piece reads and writes are translated into spans of
//! that space and then into per-file offsets, so a block can straddle
//! any number of file boundaries. Blocks go to disk as they arrive;
//! the [`Assembler`] only tracks which ranges of a piece are present and
//! which peers supplied them, and once a piece is fully covered it is
//! read back and SHA-1 verified off the async runtime.

mod assembler;
mod error;
mod resume;
mod store;


pub use assembler::Assembler;
pub use error::StorageError;
pub use resume::ResumeData;
pub use store::{FileSpan, PieceStore};
