//! HTTP tracker protocol and announce scheduling.
//!
//! Trackers are organized in tiers (from `announce-list`, or a single
//! tier built from `announce`). Each announce walks the tiers in order
//! and the trackers within a tier in order, promoting whichever tracker
//! answered to the front of its tier. A tracker that returns a
//! `failure reason` is disabled for the rest of the session; transport
//! errors just move on to the next candidate.
//!
//! The wire exchange itself sits behind [`AnnounceTransport`] so the
//! fallback logic can be driven by scripted responses in tests.

mod client;
mod error;
mod http;
mod response;

#[cfg(test)]
mod tests;

pub use client::{AnnounceRequest, AnnounceTransport, TrackerClient};
pub use error::TrackerError;
pub use http::{scrape_url, HttpAnnouncer};
pub use response::{AnnounceResponse, ScrapeEntry, TrackerEvent};
