use super::client::{AnnounceRequest, AnnounceTransport};
use super::error::TrackerError;
use super::response::{parse_announce, parse_scrape, AnnounceResponse, ScrapeEntry};
use reqwest::Client;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Announce transport speaking the HTTP tracker protocol.
pub struct HttpAnnouncer {
    client: Client,
}

impl HttpAnnouncer {
    pub fn new() -> Result<Self, TrackerError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(TrackerError::Http)?;
        Ok(Self { client })
    }

    fn build_url(url: &str, request: &AnnounceRequest) -> Result<String, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }

        let separator = if url.contains('?') { '&' } else { '?' };
        let mut full = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            url,
            separator,
            url_encode(&request.info_hash),
            url_encode(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.numwant,
        );

        let event = request.event.as_str();
        if !event.is_empty() {
            full.push_str("&event=");
            full.push_str(event);
        }

        Ok(full)
    }

    /// Fetches swarm statistics for one torrent from a tracker that
    /// follows the scrape URL convention. Returns `None` when the
    /// tracker does not report this torrent.
    pub async fn scrape(
        &self,
        announce_url: &str,
        info_hash: &[u8; 20],
    ) -> Result<Option<ScrapeEntry>, TrackerError> {
        let base = scrape_url(announce_url)
            .ok_or_else(|| TrackerError::InvalidUrl(announce_url.to_string()))?;
        let separator = if base.contains('?') { '&' } else { '?' };
        let full = format!("{}{}info_hash={}", base, separator, url_encode(info_hash));

        let response = self.client.get(&full).send().await?;
        let bytes = response.bytes().await?;
        let mut entries = parse_scrape(&bytes)?;
        Ok(entries.remove(info_hash))
    }
}

/// Derives a scrape URL from an announce URL.
///
/// The convention requires the last path segment to begin with
/// `announce`; it is rewritten to `scrape`. Trackers without such a
/// segment do not support scraping.
pub fn scrape_url(announce: &str) -> Option<String> {
    let (base, query) = match announce.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (announce, None),
    };

    let slash = base.rfind('/')?;
    let segment = &base[slash + 1..];
    let suffix = segment.strip_prefix("announce")?;

    let mut url = format!("{}/scrape{}", &base[..slash], suffix);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    Some(url)
}

impl AnnounceTransport for HttpAnnouncer {
    async fn announce(
        &self,
        url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let full = Self::build_url(url, request)?;
        let response = self.client.get(&full).send().await?;
        let bytes = response.bytes().await?;
        parse_announce(&bytes)
    }
}

/// Percent-encodes raw bytes the way trackers expect: unreserved ASCII
/// passes through, everything else becomes `%XX`.
fn url_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::response::TrackerEvent;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0xAB; 20],
            peer_id: *b"-RP0010-abcdefghijkl",
            port: 6881,
            uploaded: 100,
            downloaded: 200,
            left: 300,
            event: TrackerEvent::Started,
            numwant: 50,
        }
    }

    #[test]
    fn url_encoding_escapes_binary() {
        assert_eq!(url_encode(&[0xAB, 0xCD]), "%AB%CD");
        assert_eq!(url_encode(b"a-z_0.9~"), "a-z_0.9~");
        assert_eq!(url_encode(b" /"), "%20%2F");
    }

    #[test]
    fn announce_url_carries_all_parameters() {
        let url = HttpAnnouncer::build_url("http://t.example/announce", &request()).unwrap();
        assert!(url.starts_with("http://t.example/announce?info_hash=%AB"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&uploaded=100"));
        assert!(url.contains("&downloaded=200"));
        assert!(url.contains("&left=300"));
        assert!(url.contains("&compact=1"));
        assert!(url.contains("&numwant=50"));
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn announce_url_appends_to_existing_query() {
        let url = HttpAnnouncer::build_url("http://t.example/a?key=1", &request()).unwrap();
        assert!(url.starts_with("http://t.example/a?key=1&info_hash="));
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        let err = HttpAnnouncer::build_url("udp://t.example", &request()).unwrap_err();
        assert!(matches!(err, TrackerError::InvalidUrl(_)));
    }

    #[test]
    fn scrape_url_follows_the_convention() {
        assert_eq!(
            scrape_url("http://t.example/announce").as_deref(),
            Some("http://t.example/scrape")
        );
        assert_eq!(
            scrape_url("http://t.example/announce.php?key=abc").as_deref(),
            Some("http://t.example/scrape.php?key=abc")
        );
        assert_eq!(scrape_url("http://t.example/a/x"), None);
    }
}
