//! Session configuration.
//!
//! Every empirically-tuned policy value in the engine lives here as a
//! field with a default, so deployments can adjust them without touching
//! the scheduling or choking code. No correctness property depends on the
//! exact numbers; the invariants the engine enforces (request partitioning,
//! unchoke slot bounds, hash verification) hold for any setting.

use std::time::Duration;

/// Standard block size requested over the wire (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

/// Maximum request length a remote peer may ask for (128 KiB per BEP-3).
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Largest frame we will accept before declaring a protocol violation.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Tuning parameters for one download session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Port we listen on and report to trackers.
    pub listen_port: u16,
    /// Hard cap on simultaneous peer connections. New connections beyond
    /// this are declined, which is not an error.
    pub max_peers: usize,
    /// Regular unchoke slots. One extra optimistic slot exists on top.
    pub max_uploads: usize,
    /// How often the choker recomputes unchoke decisions.
    pub choke_interval: Duration,
    /// How often the optimistic unchoke slot rotates.
    pub optimistic_interval: Duration,
    /// A peer that has sent no data for this long is snubbed and excluded
    /// from rate-based unchoke ranking.
    pub snub_window: Duration,
    /// Connections that have not completed the handshake within this
    /// grace period are dropped.
    pub handshake_grace: Duration,
    /// Connections with no traffic in either direction for this long are
    /// force-closed.
    pub idle_timeout: Duration,
    /// Interval between keep-alive frames on otherwise quiet connections.
    pub keepalive_interval: Duration,
    /// Lower bound on the per-peer outstanding request backlog.
    pub backlog_min: usize,
    /// Upper bound on the per-peer outstanding request backlog.
    pub backlog_max: usize,
    /// Seconds of measured download rate the backlog tries to keep in
    /// flight (backlog = rate * pipeline_secs / block size, clamped).
    pub pipeline_secs: f64,
    /// Until this many pieces are verified the picker may take any piece
    /// a peer can fulfill instead of strictly enforcing rarest-first.
    pub rarest_first_cutoff: u32,
    /// Bucket-space distance between file priority levels in the picker.
    pub priority_step: u32,
    /// Corrupt pieces attributed to a peer before it is disconnected.
    pub hash_fail_kick: u32,
    /// Corrupt pieces attributed to a peer before its address is banned.
    pub hash_fail_ban: u32,
    /// Upload limit in bytes per second. Zero means unlimited.
    pub upload_limit: u64,
    /// Enable the automatic upload tuner (ignores `upload_limit` as a
    /// starting point and adjusts from congestion feedback).
    pub auto_tune: bool,
    /// Unchoke-to-first-request latency above which the tuner considers
    /// the link congested.
    pub tune_ping_threshold: Duration,
    /// Number of latency samples the tuner keeps in its sliding window.
    pub tune_window: usize,
    /// Multiplicative factor applied to the rate when congested.
    pub tune_decrease: f64,
    /// Fraction of the current rate added back per evaluation otherwise.
    pub tune_increase: f64,
    /// Floor for the auto-tuned rate in bytes per second.
    pub tune_floor: u64,
    /// How often the tuner evaluates its sample window.
    pub tune_interval: Duration,
    /// Number of peers requested from trackers per announce.
    pub numwant: u32,
    /// Retry delay for tracker announces before any has succeeded.
    pub tracker_retry: Duration,
    /// Super-seed mode: withhold the full bitfield and trickle out `have`
    /// announcements one piece per peer to force redistribution.
    pub super_seed: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_peers: 80,
            max_uploads: 4,
            choke_interval: Duration::from_secs(10),
            optimistic_interval: Duration::from_secs(30),
            snub_window: Duration::from_secs(30),
            handshake_grace: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(240),
            keepalive_interval: Duration::from_secs(120),
            backlog_min: 2,
            backlog_max: 96,
            pipeline_secs: 3.0,
            rarest_first_cutoff: 4,
            priority_step: 1_000_000,
            hash_fail_kick: 3,
            hash_fail_ban: 5,
            upload_limit: 0,
            auto_tune: false,
            tune_ping_threshold: Duration::from_millis(1500),
            tune_window: 8,
            tune_decrease: 0.8,
            tune_increase: 0.05,
            tune_floor: 16 * 1024,
            tune_interval: Duration::from_secs(5),
            numwant: 50,
            tracker_retry: Duration::from_secs(60),
            super_seed: false,
        }
    }
}

impl SessionConfig {
    /// Backlog size for a peer delivering `rate` bytes per second.
    pub fn backlog_for_rate(&self, rate: f64) -> usize {
        let wanted = (rate * self.pipeline_secs / BLOCK_SIZE as f64).ceil() as usize;
        wanted.clamp(self.backlog_min, self.backlog_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_clamps_to_bounds() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.backlog_for_rate(0.0), cfg.backlog_min);
        assert_eq!(cfg.backlog_for_rate(1e12), cfg.backlog_max);

        // 160 KiB/s at 3s pipeline is 30 blocks.
        let mid = cfg.backlog_for_rate(160.0 * 1024.0);
        assert!(mid > cfg.backlog_min && mid < cfg.backlog_max);
    }
}
