use super::error::TrackerError;
use super::response::{AnnounceResponse, TrackerEvent};
use std::future::Future;
use tracing::{debug, warn};

/// Everything one announce carries.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes still missing; zero marks us as a seed.
    pub left: u64,
    pub event: TrackerEvent,
    pub numwant: u32,
}

/// One announce exchange against a single tracker URL.
///
/// Implemented over HTTP by [`super::HttpAnnouncer`]; tests drive the
/// tier logic with scripted transports instead.
pub trait AnnounceTransport: Send + Sync + 'static {
    fn announce(
        &self,
        url: &str,
        request: &AnnounceRequest,
    ) -> impl Future<Output = Result<AnnounceResponse, TrackerError>> + Send;
}

struct Tracker {
    url: String,
    /// Set when the tracker returned a `failure reason`; never cleared.
    disabled: bool,
}

/// Multi-tier tracker fallback.
///
/// Walks tiers in order and trackers within a tier in order. A tracker
/// that answers is promoted to the front of its tier so it gets asked
/// first next time; one that returns `failure reason` is disabled for
/// the rest of the session.
pub struct TrackerClient<T> {
    transport: T,
    tiers: Vec<Vec<Tracker>>,
}

impl<T: AnnounceTransport> TrackerClient<T> {
    pub fn new(transport: T, tiers: Vec<Vec<String>>) -> Self {
        let tiers = tiers
            .into_iter()
            .map(|tier| {
                tier.into_iter()
                    .map(|url| Tracker {
                        url,
                        disabled: false,
                    })
                    .collect()
            })
            .collect();
        Self { transport, tiers }
    }

    /// True while at least one tracker can still be asked.
    pub fn has_usable_tracker(&self) -> bool {
        self.tiers
            .iter()
            .any(|tier| tier.iter().any(|t| !t.disabled))
    }

    /// Announces to the first tracker that answers.
    ///
    /// Returns the last error seen when every candidate fails, or
    /// [`TrackerError::Exhausted`] when none was usable to begin with.
    pub async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let mut last_error = None;

        for tier in &mut self.tiers {
            for index in 0..tier.len() {
                if tier[index].disabled {
                    continue;
                }

                match self.transport.announce(&tier[index].url, request).await {
                    Ok(response) => {
                        debug!(
                            url = %tier[index].url,
                            peers = response.peers.len() + response.peers6.len(),
                            interval = response.interval,
                            "announce ok"
                        );
                        let tracker = tier.remove(index);
                        tier.insert(0, tracker);
                        return Ok(response);
                    }
                    Err(TrackerError::Failure(reason)) => {
                        warn!(url = %tier[index].url, %reason, "tracker disabled");
                        tier[index].disabled = true;
                        last_error = Some(TrackerError::Failure(reason));
                    }
                    Err(error) => {
                        debug!(url = %tier[index].url, %error, "announce failed");
                        last_error = Some(error);
                    }
                }
            }
        }

        Err(last_error.unwrap_or(TrackerError::Exhausted))
    }
}
