use super::*;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

#[test]
fn peer_id_has_client_prefix() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_id(), Some("RP0010"));
}

#[test]
fn handshake_round_trip() {
    let handshake = Handshake::new([7u8; 20], [9u8; 20]);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.info_hash, [7u8; 20]);
    assert_eq!(decoded.peer_id, [9u8; 20]);
}

#[test]
fn handshake_rejects_wrong_protocol() {
    let mut bad = Handshake::new([0u8; 20], [0u8; 20]).encode().to_vec();
    bad[3] ^= 0xFF;
    assert!(Handshake::decode(&bad).is_err());
}

fn strip_length_prefix(frame: Bytes) -> Bytes {
    frame.slice(4..)
}

#[test]
fn message_round_trip() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xA0])),
        Message::Request {
            index: 3,
            begin: 16384,
            length: 16384,
        },
        Message::Piece {
            index: 3,
            begin: 16384,
            data: Bytes::from_static(b"block bytes"),
        },
        Message::Cancel {
            index: 3,
            begin: 16384,
            length: 16384,
        },
    ];

    for msg in messages {
        let body = strip_length_prefix(msg.encode());
        assert_eq!(Message::decode(body).unwrap(), msg);
    }
}

#[test]
fn message_rejects_garbage() {
    // Unknown id.
    assert!(Message::decode(Bytes::from_static(&[99])).is_err());
    // Truncated have.
    assert!(Message::decode(Bytes::from_static(&[4, 0, 0])).is_err());
    // Request with trailing junk.
    assert!(Message::decode(Bytes::from_static(&[6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1])).is_err());
    // Choke with payload.
    assert!(Message::decode(Bytes::from_static(&[0, 1])).is_err());
}

#[test]
fn bitfield_bit_positions() {
    let mut bf = Bitfield::new(12);
    assert!(!bf.has(0));

    bf.set(0);
    bf.set(11);
    assert!(bf.has(0));
    assert!(bf.has(11));
    assert!(!bf.has(5));
    assert_eq!(bf.count(), 2);

    // High bit of first byte is piece 0.
    assert_eq!(bf.as_bytes()[0] & 0x80, 0x80);
}

#[test]
fn bitfield_from_wire_validates() {
    // 12 pieces need exactly 2 bytes.
    assert!(Bitfield::from_wire(&Bytes::from_static(&[0xFF]), 12).is_none());
    assert!(Bitfield::from_wire(&Bytes::from_static(&[0xFF, 0xF0]), 12).is_some());
    // Spare bit set past the last piece.
    assert!(Bitfield::from_wire(&Bytes::from_static(&[0xFF, 0xF8]), 12).is_none());
}

#[test]
fn bitfield_full_is_complete() {
    let bf = Bitfield::full(13);
    assert!(bf.is_complete());
    assert_eq!(bf.count(), 13);
}

struct StubPeer {
    addr: SocketAddr,
    interested: bool,
    choked: bool,
    rate: f64,
    snubbed: bool,
}

impl StubPeer {
    fn new(port: u16, rate: f64) -> Self {
        Self {
            addr: format!("10.0.0.1:{}", port).parse().unwrap(),
            interested: true,
            choked: true,
            rate,
            snubbed: false,
        }
    }
}

impl ChokeView for StubPeer {
    fn addr(&self) -> SocketAddr {
        self.addr
    }
    fn peer_interested(&self) -> bool {
        self.interested
    }
    fn am_choking(&self) -> bool {
        self.choked
    }
    fn download_rate(&mut self) -> f64 {
        self.rate
    }
    fn upload_rate(&mut self) -> f64 {
        self.rate
    }
    fn is_snubbed(&self) -> bool {
        self.snubbed
    }
}

fn apply(peers: &mut [StubPeer], decisions: &[ChokeDecision]) {
    for d in decisions {
        let peer = peers.iter_mut().find(|p| p.addr == d.addr).unwrap();
        peer.choked = !d.unchoke;
    }
}

#[test]
fn choker_never_exceeds_slot_budget() {
    let max_uploads = 3;
    let mut choker = Choker::new(max_uploads);
    let mut peers: Vec<StubPeer> = (0..10)
        .map(|i| StubPeer::new(7000 + i, (i as f64) * 100.0))
        .collect();

    for rotate in [false, true, true, false] {
        let mut views: Vec<&mut StubPeer> = peers.iter_mut().collect();
        let decisions = choker.rechoke(&mut views, false, rotate);
        apply(&mut peers, &decisions);

        let unchoked = peers.iter().filter(|p| !p.choked).count();
        assert!(unchoked <= max_uploads + 1, "unchoked {}", unchoked);
    }
}

#[test]
fn choker_prefers_fast_peers() {
    let mut choker = Choker::new(2);
    let mut peers = vec![
        StubPeer::new(1, 10.0),
        StubPeer::new(2, 5000.0),
        StubPeer::new(3, 3000.0),
        StubPeer::new(4, 1.0),
    ];

    let mut views: Vec<&mut StubPeer> = peers.iter_mut().collect();
    let decisions = choker.rechoke(&mut views, false, false);
    apply(&mut peers, &decisions);

    assert!(!peers[1].choked);
    assert!(!peers[2].choked);
}

#[test]
fn choker_skips_snubbed_peers_in_ranking() {
    let mut choker = Choker::new(1);
    let mut peers = vec![StubPeer::new(1, 9000.0), StubPeer::new(2, 100.0)];
    peers[0].snubbed = true;

    let mut views: Vec<&mut StubPeer> = peers.iter_mut().collect();
    let decisions = choker.rechoke(&mut views, false, false);
    apply(&mut peers, &decisions);

    // The snubbed peer cannot win a regular slot despite its rate.
    assert!(!peers[1].choked);
}

#[test]
fn choker_ignores_uninterested_peers() {
    let mut choker = Choker::new(4);
    let mut peers = vec![StubPeer::new(1, 500.0), StubPeer::new(2, 500.0)];
    peers[0].interested = false;

    let mut views: Vec<&mut StubPeer> = peers.iter_mut().collect();
    let decisions = choker.rechoke(&mut views, false, false);
    apply(&mut peers, &decisions);

    assert!(peers[0].choked);
    assert!(!peers[1].choked);
}

#[test]
fn super_seeder_hands_out_one_piece_at_a_time() {
    let mut seeder = SuperSeeder::new();
    let ours = Bitfield::full(4);
    let theirs = Bitfield::new(4);

    let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
    let b: SocketAddr = "10.0.0.2:2".parse().unwrap();

    let pa = seeder.next_assignment(a, &ours, &theirs).unwrap();
    let pb = seeder.next_assignment(b, &ours, &theirs).unwrap();
    assert_ne!(pa, pb, "two peers must spread different pieces");

    // No second piece while the first is still spreading.
    assert_eq!(seeder.next_assignment(a, &ours, &theirs), None);

    // Once piece pa shows up elsewhere, a is freed for the next one.
    assert_eq!(seeder.piece_spread(pa), Some(a));
    let next = seeder.next_assignment(a, &ours, &theirs).unwrap();
    assert_ne!(next, pa);
    assert_ne!(next, pb);
}

#[test]
fn super_seeder_never_reassigns_a_spread_piece() {
    let mut seeder = SuperSeeder::new();
    let ours = Bitfield::full(2);
    let theirs = Bitfield::new(2);

    let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
    let b: SocketAddr = "10.0.0.2:2".parse().unwrap();

    let pa = seeder.next_assignment(a, &ours, &theirs).unwrap();
    assert_eq!(seeder.piece_spread(pa), Some(a));

    // The freed peer's bitfield may lag, but a piece that already
    // redistributed is done; both it and a fresh peer get the other one.
    let next = seeder.next_assignment(a, &ours, &theirs).unwrap();
    assert_ne!(next, pa);
    assert_eq!(seeder.piece_spread(next), Some(a));

    assert_eq!(seeder.next_assignment(b, &ours, &theirs), None);
}

#[test]
fn rate_meter_measures_recent_traffic() {
    let mut meter = RateMeter::default();
    meter.record(50_000);
    // 50 KB over a 5s window.
    let rate = meter.rate();
    assert!((rate - 10_000.0).abs() < 1.0);
}

#[test]
fn snub_detection_requires_outstanding_requests() {
    let (tx, _rx) = tokio::sync::mpsc::channel(8);
    let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
    let mut conn = PeerConnection::new(addr, PeerId::generate(), 16, tx, Duration::ZERO);

    // Quiet but with nothing outstanding: not snubbed.
    assert!(!conn.snubbed());

    conn.requests.insert(BlockRequest::new(0, 0, 16384));
    assert!(conn.snubbed(), "quiet peer with pending requests is snubbed");
}
