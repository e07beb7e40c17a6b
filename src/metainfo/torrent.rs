use super::error::MetainfoError;
use crate::bencode::{decode, encode, Value};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// A parsed torrent file.
///
/// # Examples
///
/// ```no_run
/// use riptide::metainfo::Metainfo;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let data = std::fs::read("example.torrent")?;
/// let metainfo = Metainfo::from_bytes(&data)?;
///
/// println!("{}: {} bytes", metainfo.info.name, metainfo.info.total_length);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The info dictionary with file and piece data.
    pub info: Info,
    /// SHA-1 of the bencoded info dictionary; identifies the torrent.
    pub info_hash: [u8; 20],
    /// Primary tracker URL.
    pub announce: Option<String>,
    /// Multi-tier tracker list.
    pub announce_list: Vec<Vec<String>>,
    /// HTTP seed URLs (`httpseeds` key).
    pub httpseeds: Vec<String>,
    /// Web seed URLs (`url-list` key).
    pub url_list: Vec<String>,
    /// Unix timestamp when the torrent was created.
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub(super) raw_info: Bytes,
}

/// The info dictionary: everything covered by the info hash.
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file or root directory.
    pub name: String,
    /// Bytes per piece (every piece but the last).
    pub piece_length: u64,
    /// SHA-1 hash of each piece.
    pub pieces: Vec<[u8; 20]>,
    /// Ordered file records; offsets partition `0..total_length`.
    pub files: Vec<FileRecord>,
    /// Total size of all files combined.
    pub total_length: u64,
    /// If true, clients should use only the trackers in the metainfo.
    pub private: bool,
}

/// One file within the torrent's flat byte address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Path relative to the torrent root.
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset within the concatenated torrent data.
    pub offset: u64,
}

impl Metainfo {
    /// Parses and validates a torrent file.
    ///
    /// # Errors
    ///
    /// Fails if the data is not valid bencode, a required field is
    /// missing, or the piece count does not match the total length.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let value = decode(data)?;
        let dict = value.as_dict().ok_or(MetainfoError::InvalidField("root"))?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;

        let raw_info = Bytes::from(encode(info_value));
        let info_hash = sha1_of(&raw_info);
        let info = parse_info(info_value)?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let announce_list = dict
            .get(b"announce-list".as_slice())
            .and_then(|v| v.as_list())
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_str().map(String::from))
                                .collect::<Vec<_>>()
                        })
                    })
                    .filter(|tier: &Vec<String>| !tier.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let httpseeds = string_list(dict.get(b"httpseeds".as_slice()));
        let url_list = string_list(dict.get(b"url-list".as_slice()));

        let creation_date = dict
            .get(b"creation date".as_slice())
            .and_then(|v| v.as_integer());
        let comment = dict
            .get(b"comment".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);
        let created_by = dict
            .get(b"created by".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(Self {
            info,
            info_hash,
            announce,
            announce_list,
            httpseeds,
            url_list,
            creation_date,
            comment,
            created_by,
            raw_info,
        })
    }

    /// Serializes the metainfo back to canonical `.torrent` bytes.
    ///
    /// The original raw info dictionary is reused so the info hash is
    /// preserved exactly.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetainfoError> {
        let mut dict = BTreeMap::new();

        if let Some(ref announce) = self.announce {
            dict.insert(key("announce"), Value::string(announce));
        }
        if !self.announce_list.is_empty() {
            let tiers = self
                .announce_list
                .iter()
                .map(|tier| Value::List(tier.iter().map(|u| Value::string(u)).collect()))
                .collect();
            dict.insert(key("announce-list"), Value::List(tiers));
        }
        if !self.httpseeds.is_empty() {
            let urls = self.httpseeds.iter().map(|u| Value::string(u)).collect();
            dict.insert(key("httpseeds"), Value::List(urls));
        }
        if !self.url_list.is_empty() {
            let urls = self.url_list.iter().map(|u| Value::string(u)).collect();
            dict.insert(key("url-list"), Value::List(urls));
        }
        if let Some(date) = self.creation_date {
            dict.insert(key("creation date"), Value::Integer(date));
        }
        if let Some(ref comment) = self.comment {
            dict.insert(key("comment"), Value::string(comment));
        }
        if let Some(ref created_by) = self.created_by {
            dict.insert(key("created by"), Value::string(created_by));
        }

        dict.insert(key("info"), decode(&self.raw_info)?);

        Ok(encode(&Value::Dict(dict)))
    }

    /// The raw bencoded info dictionary.
    pub fn raw_info(&self) -> &Bytes {
        &self.raw_info
    }

    /// Tracker tiers for the announce cycle.
    ///
    /// `announce-list` takes precedence when present; otherwise the
    /// single `announce` URL forms a one-tracker tier.
    pub fn announce_tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            self.announce_list.clone()
        } else if let Some(ref url) = self.announce {
            vec![vec![url.clone()]]
        } else {
            Vec::new()
        }
    }
}

impl Info {
    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Length of the piece at `index`; only the last piece may be short.
    pub fn piece_size(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        (self.total_length - start).min(self.piece_length)
    }
}

impl fmt::Display for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes, {} pieces)",
            self.info.name,
            self.info.total_length,
            self.info.pieces.len()
        )
    }
}

fn key(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_list())
        .map(|list| {
            list.iter()
                .filter_map(|u| u.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

pub(super) fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn parse_info(value: &Value) -> Result<Info, MetainfoError> {
    let dict = value.as_dict().ok_or(MetainfoError::InvalidField("info"))?;

    let name = dict
        .get(b"name".as_slice())
        .and_then(|v| v.as_str())
        .ok_or(MetainfoError::MissingField("name"))?
        .to_string();

    let piece_length = dict
        .get(b"piece length".as_slice())
        .and_then(|v| v.as_integer())
        .filter(|&v| v > 0)
        .ok_or(MetainfoError::MissingField("piece length"))? as u64;

    let pieces_bytes = dict
        .get(b"pieces".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or(MetainfoError::MissingField("pieces"))?;

    if pieces_bytes.len() % 20 != 0 {
        return Err(MetainfoError::InvalidField("pieces"));
    }

    let pieces: Vec<[u8; 20]> = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let private = dict
        .get(b"private".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v == 1)
        .unwrap_or(false);

    let (files, total_length) = parse_files(dict, &name)?;

    // piece count must be ceil(total / piece length)
    let expected = total_length.div_ceil(piece_length);
    if pieces.len() as u64 != expected {
        return Err(MetainfoError::PieceCountMismatch {
            declared: pieces.len() as u64,
            expected,
        });
    }

    Ok(Info {
        name,
        piece_length,
        pieces,
        files,
        total_length,
        private,
    })
}

fn parse_files(
    dict: &BTreeMap<Bytes, Value>,
    name: &str,
) -> Result<(Vec<FileRecord>, u64), MetainfoError> {
    if let Some(length) = dict.get(b"length".as_slice()).and_then(|v| v.as_integer()) {
        let length = length as u64;
        let file = FileRecord {
            path: PathBuf::from(name),
            length,
            offset: 0,
        };
        return Ok((vec![file], length));
    }

    let files_list = dict
        .get(b"files".as_slice())
        .and_then(|v| v.as_list())
        .ok_or(MetainfoError::MissingField("length or files"))?;

    let mut files = Vec::new();
    let mut offset = 0u64;

    for file_value in files_list {
        let file_dict = file_value
            .as_dict()
            .ok_or(MetainfoError::InvalidField("files"))?;

        let length = file_dict
            .get(b"length".as_slice())
            .and_then(|v| v.as_integer())
            .ok_or(MetainfoError::MissingField("file length"))? as u64;

        let path_list = file_dict
            .get(b"path".as_slice())
            .and_then(|v| v.as_list())
            .ok_or(MetainfoError::MissingField("file path"))?;

        let path: PathBuf = std::iter::once(name.to_string())
            .chain(
                path_list
                    .iter()
                    .filter_map(|p| p.as_str().map(String::from)),
            )
            .collect();

        files.push(FileRecord {
            path,
            length,
            offset,
        });
        offset += length;
    }

    if files.is_empty() {
        return Err(MetainfoError::InvalidField("files"));
    }

    Ok((files, offset))
}
