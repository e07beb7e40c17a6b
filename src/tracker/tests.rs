use super::client::{AnnounceRequest, AnnounceTransport, TrackerClient};
use super::response::{parse_announce, parse_scrape, AnnounceResponse, TrackerEvent};
use super::TrackerError;
use crate::bencode::{encode, Value};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};

fn request() -> AnnounceRequest {
    AnnounceRequest {
        info_hash: [1; 20],
        peer_id: [2; 20],
        port: 6881,
        uploaded: 0,
        downloaded: 0,
        left: 1000,
        event: TrackerEvent::None,
        numwant: 50,
    }
}

fn response_bytes(entries: Vec<(&str, Value)>) -> Vec<u8> {
    let mut dict = BTreeMap::new();
    for (key, value) in entries {
        dict.insert(Bytes::copy_from_slice(key.as_bytes()), value);
    }
    encode(&Value::Dict(dict))
}

#[derive(Default)]
struct ScriptedTransport {
    calls: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, VecDeque<Result<AnnounceResponse, TrackerError>>>>,
}

impl ScriptedTransport {
    fn script(&self, url: &str, result: Result<AnnounceResponse, TrackerError>) {
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(result);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl AnnounceTransport for &'static ScriptedTransport {
    async fn announce(
        &self,
        url: &str,
        _request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        self.calls.lock().push(url.to_string());
        self.responses
            .lock()
            .get_mut(url)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Err(TrackerError::InvalidResponse("unscripted")))
    }
}

fn leak(transport: ScriptedTransport) -> &'static ScriptedTransport {
    Box::leak(Box::new(transport))
}

#[tokio::test]
async fn working_tracker_is_promoted_within_its_tier() {
    let transport = leak(ScriptedTransport::default());
    transport.script("http://a/ann", Err(TrackerError::InvalidResponse("down")));
    transport.script("http://b/ann", Ok(AnnounceResponse::new(60)));
    transport.script("http://b/ann", Ok(AnnounceResponse::new(60)));

    let mut client = TrackerClient::new(
        transport,
        vec![vec!["http://a/ann".to_string(), "http://b/ann".to_string()]],
    );

    client.announce(&request()).await.unwrap();
    // After b answered it moves to the front and is asked first.
    client.announce(&request()).await.unwrap();

    assert_eq!(
        transport.calls(),
        vec!["http://a/ann", "http://b/ann", "http://b/ann"]
    );
}

#[tokio::test]
async fn failure_reason_disables_tracker_permanently() {
    let transport = leak(ScriptedTransport::default());
    transport.script(
        "http://bad/ann",
        Err(TrackerError::Failure("torrent disallowed".into())),
    );
    transport.script("http://good/ann", Ok(AnnounceResponse::new(60)));
    transport.script("http://good/ann", Ok(AnnounceResponse::new(60)));

    let mut client = TrackerClient::new(
        transport,
        vec![vec![
            "http://bad/ann".to_string(),
            "http://good/ann".to_string(),
        ]],
    );

    client.announce(&request()).await.unwrap();
    client.announce(&request()).await.unwrap();

    // The disallowed tracker is never contacted again.
    let calls = transport.calls();
    assert_eq!(
        calls.iter().filter(|u| u.contains("bad")).count(),
        1,
        "calls: {:?}",
        calls
    );
    assert!(client.has_usable_tracker());
}

#[tokio::test]
async fn lower_tiers_are_tried_after_upper_ones() {
    let transport = leak(ScriptedTransport::default());
    transport.script("http://t1/ann", Err(TrackerError::InvalidResponse("down")));
    transport.script("http://t2/ann", Ok(AnnounceResponse::new(60)));

    let mut client = TrackerClient::new(
        transport,
        vec![
            vec!["http://t1/ann".to_string()],
            vec!["http://t2/ann".to_string()],
        ],
    );

    client.announce(&request()).await.unwrap();
    assert_eq!(transport.calls(), vec!["http://t1/ann", "http://t2/ann"]);
}

#[tokio::test]
async fn all_trackers_disabled_means_no_usable_tracker() {
    let transport = leak(ScriptedTransport::default());
    transport.script(
        "http://only/ann",
        Err(TrackerError::Failure("unregistered torrent".into())),
    );

    let mut client =
        TrackerClient::new(transport, vec![vec!["http://only/ann".to_string()]]);

    assert!(client.has_usable_tracker());
    assert!(matches!(
        client.announce(&request()).await,
        Err(TrackerError::Failure(_))
    ));
    assert!(!client.has_usable_tracker());

    // Nothing left to ask.
    assert!(client.announce(&request()).await.is_err());
    assert_eq!(transport.calls().len(), 1);
}

#[test]
fn parses_compact_peers() {
    let peers = Bytes::from_static(&[10, 0, 0, 1, 0x1A, 0xE1, 192, 168, 1, 2, 0x1B, 0x39]);
    let body = response_bytes(vec![
        ("complete", Value::Integer(5)),
        ("incomplete", Value::Integer(10)),
        ("interval", Value::Integer(1800)),
        ("peers", Value::Bytes(peers)),
    ]);

    let response = parse_announce(&body).unwrap();
    assert_eq!(response.interval, 1800);
    assert_eq!(response.complete, Some(5));
    assert_eq!(response.incomplete, Some(10));
    assert_eq!(response.peers.len(), 2);
    assert_eq!(response.peers[0], "10.0.0.1:6881".parse().unwrap());
    assert_eq!(response.peers[1], "192.168.1.2:6969".parse().unwrap());
}

#[test]
fn parses_verbose_peer_list() {
    let peer = {
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"ip"), Value::string("10.1.2.3"));
        dict.insert(Bytes::from_static(b"port"), Value::Integer(51413));
        Value::Dict(dict)
    };
    let body = response_bytes(vec![
        ("interval", Value::Integer(900)),
        ("peers", Value::List(vec![peer])),
    ]);

    let response = parse_announce(&body).unwrap();
    assert_eq!(response.peers, vec!["10.1.2.3:51413".parse().unwrap()]);
}

#[test]
fn failure_reason_surfaces_as_error() {
    let body = response_bytes(vec![(
        "failure reason",
        Value::string("torrent not registered"),
    )]);
    match parse_announce(&body) {
        Err(TrackerError::Failure(reason)) => {
            assert_eq!(reason, "torrent not registered");
        }
        other => panic!("expected failure, got {:?}", other.map(|r| r.interval)),
    }
}

#[test]
fn missing_interval_is_invalid() {
    let body = response_bytes(vec![("peers", Value::Bytes(Bytes::new()))]);
    assert!(matches!(
        parse_announce(&body),
        Err(TrackerError::InvalidResponse(_))
    ));
}

#[test]
fn parses_scrape_statistics() {
    let stats = {
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"complete"), Value::Integer(12));
        dict.insert(Bytes::from_static(b"downloaded"), Value::Integer(340));
        dict.insert(Bytes::from_static(b"incomplete"), Value::Integer(7));
        Value::Dict(dict)
    };
    let mut files = BTreeMap::new();
    files.insert(Bytes::copy_from_slice(&[0x5A; 20]), stats);
    let body = response_bytes(vec![("files", Value::Dict(files))]);

    let entries = parse_scrape(&body).unwrap();
    let entry = entries[&[0x5A; 20]];
    assert_eq!(entry.complete, 12);
    assert_eq!(entry.downloaded, 340);
    assert_eq!(entry.incomplete, 7);
}

#[test]
fn scrape_without_files_is_invalid() {
    let body = response_bytes(vec![("interval", Value::Integer(60))]);
    assert!(matches!(
        parse_scrape(&body),
        Err(TrackerError::InvalidResponse(_))
    ));
}

#[test]
fn ragged_compact_peers_are_invalid() {
    let body = response_bytes(vec![
        ("interval", Value::Integer(60)),
        ("peers", Value::Bytes(Bytes::from_static(&[1, 2, 3, 4]))),
    ]);
    assert!(matches!(
        parse_announce(&body),
        Err(TrackerError::InvalidResponse(_))
    ));
}
