use super::assembler::Assembler;
use super::error::StorageError;
use crate::bencode::{decode, encode, Value};
use crate::peer::Bitfield;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Snapshot of download progress, bencoded for persistence.
///
/// Holds the verified bitfield plus the on-disk byte ranges of every
/// partially downloaded piece, so a restart resumes without re-fetching
/// blocks that already made it to disk. Taken whenever a piece verifies
/// and at shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeData {
    pub verified: Bytes,
    pub piece_count: u32,
    /// Piece index to sorted `[start, end)` ranges.
    pub partial: Vec<(u32, Vec<(u32, u32)>)>,
}

impl ResumeData {
    /// Captures the current state of a session's verification and
    /// assembly bookkeeping.
    pub fn capture(verified: &Bitfield, assembler: &Assembler) -> Self {
        let mut partial: Vec<(u32, Vec<(u32, u32)>)> = assembler
            .partial_pieces()
            .map(|(piece, ranges)| (piece, ranges.to_vec()))
            .collect();
        partial.sort_unstable_by_key(|(piece, _)| *piece);

        Self {
            verified: verified.to_bytes(),
            piece_count: verified.piece_count() as u32,
            partial,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut partial = BTreeMap::new();
        for (piece, ranges) in &self.partial {
            let list: Vec<Value> = ranges
                .iter()
                .map(|&(start, end)| {
                    Value::List(vec![
                        Value::Integer(start as i64),
                        Value::Integer(end as i64),
                    ])
                })
                .collect();
            partial.insert(
                Bytes::from(piece.to_string().into_bytes()),
                Value::List(list),
            );
        }

        let mut root = BTreeMap::new();
        root.insert(Bytes::from_static(b"partial"), Value::Dict(partial));
        root.insert(
            Bytes::from_static(b"pieces"),
            Value::Integer(self.piece_count as i64),
        );
        root.insert(
            Bytes::from_static(b"verified"),
            Value::Bytes(self.verified.clone()),
        );

        encode(&Value::Dict(root))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        let root = decode(data)?;

        let piece_count = root
            .get(b"pieces")
            .and_then(Value::as_integer)
            .and_then(|i| u32::try_from(i).ok())
            .ok_or(StorageError::InvalidResume("missing piece count"))?;

        let verified = root
            .get(b"verified")
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or(StorageError::InvalidResume("missing verified bitfield"))?;

        if verified.len() != (piece_count as usize).div_ceil(8) {
            return Err(StorageError::InvalidResume("verified bitfield length"));
        }

        let mut partial = Vec::new();
        let partial_dict = root
            .get(b"partial")
            .and_then(Value::as_dict)
            .ok_or(StorageError::InvalidResume("missing partial dict"))?;

        for (key, value) in partial_dict {
            let piece: u32 = std::str::from_utf8(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(StorageError::InvalidResume("bad piece key"))?;
            if piece >= piece_count {
                return Err(StorageError::InvalidResume("piece index out of range"));
            }

            let ranges = value
                .as_list()
                .ok_or(StorageError::InvalidResume("ranges not a list"))?
                .iter()
                .map(|pair| {
                    let pair = pair.as_list()?;
                    match pair {
                        [start, end] => {
                            let start = u32::try_from(start.as_integer()?).ok()?;
                            let end = u32::try_from(end.as_integer()?).ok()?;
                            (start < end).then_some((start, end))
                        }
                        _ => None,
                    }
                })
                .collect::<Option<Vec<(u32, u32)>>>()
                .ok_or(StorageError::InvalidResume("malformed range"))?;

            partial.push((piece, ranges));
        }
        partial.sort_unstable_by_key(|(piece, _)| *piece);

        Ok(Self {
            verified,
            piece_count,
            partial,
        })
    }

    /// The verified set as a bitfield, validated against the count.
    pub fn verified_bitfield(&self) -> Result<Bitfield, StorageError> {
        Bitfield::from_wire(&self.verified, self.piece_count as usize)
            .ok_or(StorageError::InvalidResume("verified bitfield bits"))
    }

    /// Replays partial coverage into an assembler.
    pub fn restore_into(&self, assembler: &mut Assembler) {
        for (piece, ranges) in &self.partial {
            assembler.restore(*piece, ranges);
        }
    }
}
