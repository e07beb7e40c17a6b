use super::error::StorageError;
use crate::metainfo::{FileRecord, Info};
use crate::peer::Bitfield;
use bytes::Bytes;
use futures::future::join_all;
use sha1::{Digest, Sha1};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// A contiguous run of bytes within one file, produced by mapping a
/// range of the flat torrent byte space onto the file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Maps an absolute byte range onto the files it touches.
///
/// `files` must be in torrent order with correct running offsets, which
/// is what metainfo parsing produces. Zero-length files never appear in
/// the output.
pub(super) fn file_spans(files: &[FileRecord], offset: u64, length: u64) -> Vec<FileSpan> {
    let mut spans = Vec::new();
    let end = offset + length;
    let mut cursor = offset;

    // First file whose range extends past the start of ours.
    let mut index = files.partition_point(|f| f.offset + f.length <= offset);

    while cursor < end && index < files.len() {
        let file = &files[index];
        let file_end = file.offset + file.length;
        let take = (end - cursor).min(file_end - cursor);
        if take > 0 {
            spans.push(FileSpan {
                file_index: index,
                file_offset: cursor - file.offset,
                length: take,
            });
        }
        cursor += take;
        index += 1;
    }

    spans
}

fn validate_paths(files: &[FileRecord]) -> Result<(), StorageError> {
    for file in files {
        for component in file.path.components() {
            match component {
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::PathTraversal(file.path.display().to_string()));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Piece-oriented disk store for one torrent.
///
/// Blocks are written as they arrive and read back for verification and
/// for serving uploads. Hashing runs on the blocking thread pool so a
/// large piece never stalls the event loop. The store itself holds no
/// progress state, so it can be shared behind an `Arc` between the
/// session loop and upload-serving tasks; the session owns the verified
/// bitfield.
pub struct PieceStore {
    base_path: PathBuf,
    files: Vec<FileRecord>,
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u64,
    total_length: u64,
}

impl PieceStore {
    pub fn new(base_path: impl Into<PathBuf>, info: &Info) -> Result<Self, StorageError> {
        validate_paths(&info.files)?;
        Ok(Self {
            base_path: base_path.into(),
            files: info.files.clone(),
            piece_hashes: info.pieces.clone(),
            piece_length: info.piece_length,
            total_length: info.total_length,
        })
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn piece_size(&self, piece: u32) -> u64 {
        let start = piece as u64 * self.piece_length;
        (self.total_length - start).min(self.piece_length)
    }

    /// Bytes not yet covered by `verified`, as reported to trackers.
    pub fn bytes_left(&self, verified: &Bitfield) -> u64 {
        (0..self.piece_count())
            .filter(|&p| !verified.has(p as usize))
            .map(|p| self.piece_size(p))
            .sum()
    }

    fn check_range(&self, piece: u32, offset: u32, length: u32) -> Result<(), StorageError> {
        if piece >= self.piece_count() {
            return Err(StorageError::InvalidPieceIndex(piece));
        }
        if offset as u64 + length as u64 > self.piece_size(piece) {
            return Err(StorageError::InvalidBlockRange {
                piece,
                offset,
                length,
            });
        }
        Ok(())
    }

    async fn open_write(&self, file_index: usize) -> Result<File, StorageError> {
        let path = self.base_path.join(&self.files[file_index].path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        Ok(file)
    }

    async fn open_read(&self, file_index: usize) -> Result<File, StorageError> {
        let path = self.base_path.join(&self.files[file_index].path);
        Ok(File::open(&path).await?)
    }

    /// Writes one block at its final position on disk.
    pub async fn write_block(
        &self,
        piece: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.check_range(piece, offset, data.len() as u32)?;

        let absolute = piece as u64 * self.piece_length + offset as u64;
        let mut written = 0usize;

        for span in file_spans(&self.files, absolute, data.len() as u64) {
            let mut file = self.open_write(span.file_index).await?;
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.write_all(&data[written..written + span.length as usize])
                .await?;
            file.flush().await?;
            written += span.length as usize;
        }

        Ok(())
    }

    /// Reads an arbitrary block back, e.g. to serve a remote request.
    pub async fn read_block(
        &self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        self.check_range(piece, offset, length)?;

        let absolute = piece as u64 * self.piece_length + offset as u64;
        let mut buf = vec![0u8; length as usize];
        let mut read = 0usize;

        for span in file_spans(&self.files, absolute, length as u64) {
            let mut file = self.open_read(span.file_index).await?;
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.read_exact(&mut buf[read..read + span.length as usize])
                .await?;
            read += span.length as usize;
        }

        Ok(Bytes::from(buf))
    }

    /// Reads a fully-assembled piece back from disk and checks it
    /// against the expected SHA-1. Hashing runs on `spawn_blocking`.
    ///
    /// Returns `Ok(false)` for a corrupt piece; only IO problems are
    /// errors.
    pub async fn verify_piece(&self, piece: u32) -> Result<bool, StorageError> {
        if piece >= self.piece_count() {
            return Err(StorageError::InvalidPieceIndex(piece));
        }

        let data = self.read_block(piece, 0, self.piece_size(piece) as u32).await?;
        let expected = self.piece_hashes[piece as usize];

        let matches = tokio::task::spawn_blocking(move || {
            let digest: [u8; 20] = Sha1::digest(&data).into();
            digest == expected
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        Ok(matches)
    }

    /// Full disk recheck: hashes every piece already on disk and
    /// returns the resulting verified set. Missing files simply leave
    /// their pieces unverified.
    pub async fn recheck(&self) -> Result<Bitfield, StorageError> {
        let mut verified = Bitfield::new(self.piece_count() as usize);
        let results =
            join_all((0..self.piece_count()).map(|piece| self.verify_piece(piece))).await;
        for (piece, result) in results.into_iter().enumerate() {
            match result {
                Ok(true) => verified.set(piece),
                Ok(false) => {}
                Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {}
                Err(e) => return Err(e),
            }
        }
        Ok(verified)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}
