use super::*;
use std::path::PathBuf;

fn single_file_torrent(length: u64, piece_length: u64) -> Vec<u8> {
    let piece_count = length.div_ceil(piece_length);
    let pieces = "x".repeat((piece_count * 20) as usize);
    let body = format!(
        "d8:announce31:http://tracker.example/announce4:infod6:lengthi{}e4:name4:test12:piece lengthi{}e6:pieces{}:{}ee",
        length,
        piece_length,
        pieces.len(),
        pieces,
    );
    body.into_bytes()
}

#[test]
fn parse_single_file() {
    let data = single_file_torrent(65536, 16384);
    let metainfo = Metainfo::from_bytes(&data).unwrap();

    assert_eq!(metainfo.info.name, "test");
    assert_eq!(metainfo.info.piece_length, 16384);
    assert_eq!(metainfo.info.total_length, 65536);
    assert_eq!(metainfo.info.piece_count(), 4);
    assert_eq!(metainfo.info.files.len(), 1);
    assert_eq!(metainfo.info.files[0].path, PathBuf::from("test"));
    assert_eq!(
        metainfo.announce.as_deref(),
        Some("http://tracker.example/announce")
    );
}

#[test]
fn parse_rejects_piece_count_mismatch() {
    // 65536 bytes at 16 KiB pieces needs 4 hashes; supply 3.
    let pieces = "x".repeat(60);
    let body = format!(
        "d4:infod6:lengthi65536e4:name4:test12:piece lengthi16384e6:pieces{}:{}ee",
        pieces.len(),
        pieces,
    );
    let err = Metainfo::from_bytes(body.as_bytes()).unwrap_err();
    assert!(matches!(err, MetainfoError::PieceCountMismatch { .. }));
}

#[test]
fn parse_multi_file_offsets() {
    let pieces = "x".repeat(20);
    let body = format!(
        "d4:infod5:filesld6:lengthi300e4:pathl1:aeed6:lengthi200e4:pathl3:sub1:beee4:name4:test12:piece lengthi16384e6:pieces{}:{}ee",
        pieces.len(),
        pieces,
    );
    let metainfo = Metainfo::from_bytes(body.as_bytes()).unwrap();

    assert_eq!(metainfo.info.total_length, 500);
    assert_eq!(metainfo.info.files.len(), 2);
    assert_eq!(metainfo.info.files[0].path, PathBuf::from("test/a"));
    assert_eq!(metainfo.info.files[0].offset, 0);
    assert_eq!(metainfo.info.files[1].path, PathBuf::from("test/sub/b"));
    assert_eq!(metainfo.info.files[1].offset, 300);
}

#[test]
fn last_piece_is_short() {
    let data = single_file_torrent(40000, 16384);
    let metainfo = Metainfo::from_bytes(&data).unwrap();

    assert_eq!(metainfo.info.piece_count(), 3);
    assert_eq!(metainfo.info.piece_size(0), 16384);
    assert_eq!(metainfo.info.piece_size(2), 40000 - 2 * 16384);
}

#[test]
fn announce_tiers_fall_back_to_announce() {
    let data = single_file_torrent(16384, 16384);
    let metainfo = Metainfo::from_bytes(&data).unwrap();

    let tiers = metainfo.announce_tiers();
    assert_eq!(tiers.len(), 1);
    assert_eq!(tiers[0], vec!["http://tracker.example/announce".to_string()]);
}

#[test]
fn round_trip_preserves_info_hash() {
    let data = single_file_torrent(65536, 16384);
    let metainfo = Metainfo::from_bytes(&data).unwrap();

    let reencoded = metainfo.to_bytes().unwrap();
    let reparsed = Metainfo::from_bytes(&reencoded).unwrap();
    assert_eq!(reparsed.info_hash, metainfo.info_hash);
}

#[tokio::test]
async fn builder_hashes_match_content() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = temp.path().join("data.bin");
    let content: Vec<u8> = (0..40000u32).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(&path, &content).await.unwrap();

    let metainfo = MetainfoBuilder::new("data.bin")
        .piece_length(16 * 1024)
        .announce("http://tracker.example/announce")
        .add_file(&path, "data.bin")
        .build()
        .await
        .unwrap();

    assert_eq!(metainfo.info.total_length, 40000);
    assert_eq!(metainfo.info.piece_count(), 3);

    // Verify the first piece hash directly.
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(&content[..16384]);
    let expected: [u8; 20] = hasher.finalize().into();
    assert_eq!(metainfo.info.pieces[0], expected);

    // And the whole thing survives serialization.
    let reparsed = Metainfo::from_bytes(&metainfo.to_bytes().unwrap()).unwrap();
    assert_eq!(reparsed.info_hash, metainfo.info_hash);
    assert_eq!(reparsed.info.pieces, metainfo.info.pieces);
}
