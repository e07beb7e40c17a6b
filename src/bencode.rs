//! Bencode encoding and decoding.
//!
//! Bencode is the serialization format BitTorrent uses for `.torrent`
//! files, tracker responses, and resume state. It is big-endian and
//! self-delimiting: integers as `i<int>e`, byte strings as `<len>:<bytes>`,
//! lists as `l...e`, and dictionaries as `d...e` with lexicographically
//! sorted, unique string keys.
//!
//! The decoder here is strict: trailing data, unsorted or duplicate
//! dictionary keys, and non-canonical integers (`-0`, leading zeros) are
//! all rejected, so any value that decodes also re-encodes byte-for-byte.
//!
//! # Examples
//!
//! ```
//! use riptide::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d3:fooi42ee").unwrap();
//! assert_eq!(value.get(b"foo").and_then(Value::as_integer), Some(42));
//! assert_eq!(encode(&value), b"d3:fooi42ee");
//! ```

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::{encode, encode_into};
pub use error::BencodeError;
pub use value::Value;

#[cfg(test)]
mod tests;
