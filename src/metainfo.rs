//! Torrent metainfo parsing and creation.
//!
//! A `.torrent` file is a bencoded dictionary with an `info` dictionary
//! (piece length, concatenated 20-byte piece hashes, and either a single
//! `length`/`name` or a `files` list), an `announce` URL, an optional
//! `announce-list` of tracker tiers, and optional `httpseeds`/`url-list`
//! entries.
//!
//! The descriptor is immutable once a download starts. Parsing enforces
//! the structural invariants the engine relies on: the sum of file
//! lengths equals the total length, and the piece count equals
//! `ceil(total / piece_length)`.

mod builder;
mod error;
mod torrent;

pub use builder::MetainfoBuilder;
pub use error::MetainfoError;
pub use torrent::{FileRecord, Info, Metainfo};

#[cfg(test)]
mod tests;
