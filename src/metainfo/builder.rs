use super::error::MetainfoError;
use super::torrent::{sha1_of, FileRecord, Info, Metainfo};
use crate::bencode::{encode, Value};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const DEFAULT_PIECE_LENGTH: u64 = 256 * 1024;
const HASH_BATCH: usize = 64;

/// Builds a `.torrent` from local files.
///
/// Reading is asynchronous; piece hashing is CPU-bound and runs in
/// batches on blocking worker threads so it never stalls the runtime
/// driving peer traffic.
///
/// # Examples
///
/// ```no_run
/// use riptide::metainfo::MetainfoBuilder;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let metainfo = MetainfoBuilder::new("movie")
///     .announce("http://tracker.example.com/announce")
///     .add_file("/data/movie.mkv", "movie.mkv")
///     .build()
///     .await?;
///
/// std::fs::write("movie.torrent", metainfo.to_bytes()?)?;
/// # Ok(())
/// # }
/// ```
pub struct MetainfoBuilder {
    name: String,
    piece_length: u64,
    announce: Option<String>,
    announce_list: Vec<Vec<String>>,
    httpseeds: Vec<String>,
    comment: Option<String>,
    private: bool,
    // (source path on disk, path recorded in the torrent)
    files: Vec<(PathBuf, PathBuf)>,
}

impl MetainfoBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            piece_length: DEFAULT_PIECE_LENGTH,
            announce: None,
            announce_list: Vec::new(),
            httpseeds: Vec::new(),
            comment: None,
            private: false,
            files: Vec::new(),
        }
    }

    pub fn piece_length(mut self, length: u64) -> Self {
        self.piece_length = length.max(16 * 1024);
        self
    }

    pub fn announce(mut self, url: impl Into<String>) -> Self {
        self.announce = Some(url.into());
        self
    }

    /// Adds a tracker tier to `announce-list`.
    pub fn tier(mut self, urls: Vec<String>) -> Self {
        self.announce_list.push(urls);
        self
    }

    pub fn httpseed(mut self, url: impl Into<String>) -> Self {
        self.httpseeds.push(url.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    pub fn add_file(
        mut self,
        source: impl Into<PathBuf>,
        torrent_path: impl Into<PathBuf>,
    ) -> Self {
        self.files.push((source.into(), torrent_path.into()));
        self
    }

    /// Reads and hashes all source files, producing the metainfo.
    pub async fn build(self) -> Result<Metainfo, MetainfoError> {
        if self.files.is_empty() {
            return Err(MetainfoError::NoFiles);
        }

        let single = self.files.len() == 1;
        let mut records = Vec::with_capacity(self.files.len());
        let mut hashes: Vec<[u8; 20]> = Vec::new();
        let mut pending: Vec<Vec<u8>> = Vec::new();
        let mut carry = Vec::with_capacity(self.piece_length as usize);
        let mut offset = 0u64;

        for (source, torrent_path) in &self.files {
            let mut file = File::open(source).await?;
            let length = file.metadata().await?.len();

            // Single-file torrents are named by the torrent itself;
            // multi-file paths live under a root directory of that name.
            let path = if single {
                PathBuf::from(&self.name)
            } else {
                PathBuf::from(&self.name).join(torrent_path)
            };

            records.push(FileRecord {
                path,
                length,
                offset,
            });
            offset += length;

            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }

                let mut chunk = &buf[..n];
                while !chunk.is_empty() {
                    let want = self.piece_length as usize - carry.len();
                    let take = want.min(chunk.len());
                    carry.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if carry.len() == self.piece_length as usize {
                        pending.push(std::mem::replace(
                            &mut carry,
                            Vec::with_capacity(self.piece_length as usize),
                        ));
                        if pending.len() >= HASH_BATCH {
                            hash_batch(&mut pending, &mut hashes).await?;
                        }
                    }
                }
            }
        }

        if !carry.is_empty() {
            pending.push(carry);
        }
        if !pending.is_empty() {
            hash_batch(&mut pending, &mut hashes).await?;
        }

        let info = Info {
            name: self.name,
            piece_length: self.piece_length,
            pieces: hashes,
            files: records,
            total_length: offset,
            private: self.private,
        };

        let raw_info = Bytes::from(encode(&info_value(&info)));
        let info_hash = sha1_of(&raw_info);

        Ok(Metainfo {
            info,
            info_hash,
            announce: self.announce,
            announce_list: self.announce_list,
            httpseeds: self.httpseeds,
            url_list: Vec::new(),
            creation_date: Some(unix_now()),
            comment: self.comment,
            created_by: Some(format!("riptide/{}", env!("CARGO_PKG_VERSION"))),
            raw_info,
        })
    }
}

async fn hash_batch(
    pending: &mut Vec<Vec<u8>>,
    hashes: &mut Vec<[u8; 20]>,
) -> Result<(), MetainfoError> {
    let batch = std::mem::take(pending);
    let hashed = tokio::task::spawn_blocking(move || {
        batch.iter().map(|piece| sha1_of(piece)).collect::<Vec<_>>()
    })
    .await
    .map_err(|e| MetainfoError::Io(std::io::Error::other(e)))?;

    hashes.extend(hashed);
    Ok(())
}

fn info_value(info: &Info) -> Value {
    let mut dict = BTreeMap::new();

    dict.insert(
        Bytes::from_static(b"name"),
        Value::string(&info.name),
    );
    dict.insert(
        Bytes::from_static(b"piece length"),
        Value::Integer(info.piece_length as i64),
    );

    let mut pieces = Vec::with_capacity(info.pieces.len() * 20);
    for hash in &info.pieces {
        pieces.extend_from_slice(hash);
    }
    dict.insert(Bytes::from_static(b"pieces"), Value::from(pieces));

    if info.private {
        dict.insert(Bytes::from_static(b"private"), Value::Integer(1));
    }

    if info.files.len() == 1 && info.files[0].path == PathBuf::from(&info.name) {
        dict.insert(
            Bytes::from_static(b"length"),
            Value::Integer(info.total_length as i64),
        );
    } else {
        let files = info
            .files
            .iter()
            .map(|file| {
                let mut entry = BTreeMap::new();
                entry.insert(
                    Bytes::from_static(b"length"),
                    Value::Integer(file.length as i64),
                );
                let components: Vec<Value> = file
                    .path
                    .components()
                    .skip(1) // the root directory is the torrent name
                    .map(|c| Value::string(&c.as_os_str().to_string_lossy()))
                    .collect();
                entry.insert(Bytes::from_static(b"path"), Value::List(components));
                Value::Dict(entry)
            })
            .collect();
        dict.insert(Bytes::from_static(b"files"), Value::List(files));
    }

    Value::Dict(dict)
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
