use super::error::TrackerError;
use crate::bencode::{decode, Value};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Announce lifecycle event reported to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerEvent {
    #[default]
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }
}

/// A successful announce: swarm statistics plus fresh peer addresses.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the next regular announce.
    pub interval: u32,
    pub min_interval: Option<u32>,
    /// Seeder count, when the tracker reports it.
    pub complete: Option<u32>,
    /// Leecher count, when the tracker reports it.
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddr>,
    pub peers6: Vec<SocketAddr>,
    pub warning_message: Option<String>,
    pub tracker_id: Option<String>,
}

impl AnnounceResponse {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            min_interval: None,
            complete: None,
            incomplete: None,
            peers: Vec::new(),
            peers6: Vec::new(),
            warning_message: None,
            tracker_id: None,
        }
    }

    pub fn all_peers(&self) -> impl Iterator<Item = &SocketAddr> {
        self.peers.iter().chain(self.peers6.iter())
    }
}

/// Parses a bencoded announce response body.
///
/// A `failure reason` key wins over everything else and surfaces as
/// [`TrackerError::Failure`]. Peers come in compact form (6 bytes per
/// peer, 18 for IPv6) or as a verbose list of dictionaries.
pub fn parse_announce(data: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = decode(data)?;
    let dict = value
        .as_dict()
        .ok_or(TrackerError::InvalidResponse("expected dict"))?;

    if let Some(failure) = dict
        .get(b"failure reason".as_slice())
        .and_then(|v| v.as_str())
    {
        return Err(TrackerError::Failure(failure.to_string()));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(|v| v.as_integer())
        .filter(|&v| v > 0)
        .ok_or(TrackerError::InvalidResponse("missing interval"))? as u32;

    let mut response = AnnounceResponse::new(interval);

    response.min_interval = dict
        .get(b"min interval".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    response.complete = dict
        .get(b"complete".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    response.incomplete = dict
        .get(b"incomplete".as_slice())
        .and_then(|v| v.as_integer())
        .map(|v| v as u32);

    response.warning_message = dict
        .get(b"warning message".as_slice())
        .and_then(|v| v.as_str())
        .map(String::from);

    response.tracker_id = dict
        .get(b"tracker id".as_slice())
        .and_then(|v| v.as_str())
        .map(String::from);

    match dict.get(b"peers".as_slice()) {
        Some(Value::Bytes(bytes)) => {
            if bytes.len() % 6 != 0 {
                return Err(TrackerError::InvalidResponse("compact peers length"));
            }
            response.peers = parse_compact_peers(bytes);
        }
        Some(Value::List(list)) => {
            for peer in list {
                let ip: Option<IpAddr> = peer
                    .get(b"ip")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok());
                let port = peer
                    .get(b"port")
                    .and_then(|v| v.as_integer())
                    .and_then(|p| u16::try_from(p).ok());

                if let (Some(ip), Some(port)) = (ip, port) {
                    response.peers.push(SocketAddr::new(ip, port));
                }
            }
        }
        _ => {}
    }

    if let Some(peers6) = dict.get(b"peers6".as_slice()).and_then(|v| v.as_bytes()) {
        response.peers6 = parse_compact_peers6(peers6);
    }

    Ok(response)
}

/// Per-torrent swarm statistics from a scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScrapeEntry {
    /// Seeders.
    pub complete: u32,
    /// Completed downloads ever reported.
    pub downloaded: u32,
    /// Leechers.
    pub incomplete: u32,
}

/// Parses a bencoded scrape response: a `files` dict keyed by raw
/// 20-byte info hash. Entries with malformed keys are skipped.
pub fn parse_scrape(data: &[u8]) -> Result<HashMap<[u8; 20], ScrapeEntry>, TrackerError> {
    let value = decode(data)?;
    let dict = value
        .as_dict()
        .ok_or(TrackerError::InvalidResponse("expected dict"))?;

    if let Some(failure) = dict
        .get(b"failure reason".as_slice())
        .and_then(|v| v.as_str())
    {
        return Err(TrackerError::Failure(failure.to_string()));
    }

    let files = dict
        .get(b"files".as_slice())
        .and_then(|v| v.as_dict())
        .ok_or(TrackerError::InvalidResponse("missing files"))?;

    let mut out = HashMap::new();
    for (hash, stats) in files {
        if hash.len() != 20 {
            continue;
        }
        let stats = stats
            .as_dict()
            .ok_or(TrackerError::InvalidResponse("scrape entry"))?;
        let field = |key: &[u8]| {
            stats
                .get(key)
                .and_then(|v| v.as_integer())
                .unwrap_or(0) as u32
        };

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(hash);
        out.insert(
            info_hash,
            ScrapeEntry {
                complete: field(b"complete"),
                downloaded: field(b"downloaded"),
                incomplete: field(b"incomplete"),
            },
        );
    }

    Ok(out)
}

/// 4 bytes IP + 2 bytes big-endian port per peer.
pub(super) fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// 16 bytes IP + 2 bytes big-endian port per peer.
pub(super) fn parse_compact_peers6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|chunk| {
            let mut ip_bytes = [0u8; 16];
            ip_bytes.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip_bytes)), port)
        })
        .collect()
}
