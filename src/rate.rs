//! Upload rate limiting.
//!
//! A token bucket gates outgoing block payloads, and an optional tuner
//! adjusts the bucket's rate from congestion feedback. The congestion
//! signal is the delay between unchoking a peer and receiving its first
//! request: a peer reacts to `unchoke` almost immediately, so a long gap
//! means our outgoing socket buffers are backed up behind block data.
//!
//! # Example
//!
//! ```
//! use riptide::UploadLimiter;
//!
//! # async fn example() {
//! // 500 KB/s upload cap.
//! let limiter = UploadLimiter::new(500_000);
//! limiter.acquire(16384).await;
//!
//! // Zero means unlimited.
//! let unlimited = UploadLimiter::new(0);
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::SessionConfig;

/// Token bucket limiter for outgoing block payloads.
///
/// Tokens refill at the configured rate and the bucket holds up to two
/// seconds of tokens, so short bursts pass without delay. Cloning shares
/// the bucket.
#[derive(Clone)]
pub struct UploadLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
}

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_update: Instant,
}

impl UploadLimiter {
    /// Creates a limiter capped at `bytes_per_sec`. Zero means unlimited.
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = if bytes_per_sec == 0 {
            f64::MAX
        } else {
            bytes_per_sec as f64
        };
        let max_tokens = if bytes_per_sec == 0 {
            f64::MAX
        } else {
            (bytes_per_sec * 2) as f64
        };
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket {
                tokens: max_tokens,
                max_tokens,
                tokens_per_sec: rate,
                last_update: Instant::now(),
            })),
        }
    }

    /// Replaces the rate, preserving accumulated tokens up to the new
    /// bucket capacity. Zero means unlimited.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock();
        if bytes_per_sec == 0 {
            bucket.tokens_per_sec = f64::MAX;
            bucket.max_tokens = f64::MAX;
            bucket.tokens = f64::MAX;
        } else {
            bucket.tokens_per_sec = bytes_per_sec as f64;
            bucket.max_tokens = (bytes_per_sec * 2) as f64;
            bucket.tokens = bucket.tokens.min(bucket.max_tokens);
        }
    }

    /// Current rate in bytes per second, or `None` when unlimited.
    pub fn rate(&self) -> Option<u64> {
        let bucket = self.bucket.lock();
        if bucket.tokens_per_sec == f64::MAX {
            None
        } else {
            Some(bucket.tokens_per_sec as u64)
        }
    }

    /// Takes `bytes` tokens, sleeping until the bucket can cover them.
    pub async fn acquire(&self, bytes: usize) {
        let wait = self.try_take(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Removes tokens and returns how long the caller must wait for the
    /// deficit to refill.
    fn try_take(&self, bytes: usize) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.last_update = now;

        bucket.tokens = (bucket.tokens + elapsed * bucket.tokens_per_sec).min(bucket.max_tokens);

        let bytes_f = bytes as f64;
        if bucket.tokens >= bytes_f {
            bucket.tokens -= bytes_f;
            Duration::ZERO
        } else {
            let needed = bytes_f - bucket.tokens;
            bucket.tokens = 0.0;
            Duration::from_secs_f64(needed / bucket.tokens_per_sec)
        }
    }
}

/// Automatic upload rate tuner.
///
/// Collects unchoke-to-first-request latencies and periodically decides
/// whether the link is congested. Congestion cuts the rate by a
/// multiplicative factor; a clean window nudges it back up by a small
/// fraction, never below the configured floor. AIMD in shape, so the
/// rate converges just under the point where uploads crowd out our own
/// outgoing requests.
pub struct UploadTuner {
    limiter: UploadLimiter,
    samples: Vec<Duration>,
    window: usize,
    ping_threshold: Duration,
    decrease: f64,
    increase: f64,
    floor: u64,
    /// Rate the tuner believes in, tracked separately because the
    /// limiter may be set to unlimited before tuning kicks in.
    rate: u64,
}

impl UploadTuner {
    pub fn new(limiter: UploadLimiter, config: &SessionConfig) -> Self {
        // Start from the configured cap, or a generous default when the
        // limiter is unlimited.
        let rate = if config.upload_limit == 0 {
            1 << 20
        } else {
            config.upload_limit
        };
        limiter.set_rate(rate);
        Self {
            limiter,
            samples: Vec::new(),
            window: config.tune_window,
            ping_threshold: config.tune_ping_threshold,
            decrease: config.tune_decrease,
            increase: config.tune_increase,
            floor: config.tune_floor,
            rate,
        }
    }

    /// Feeds one unchoke-to-first-request latency measurement.
    pub fn record_probe(&mut self, latency: Duration) {
        if self.samples.len() == self.window {
            self.samples.remove(0);
        }
        self.samples.push(latency);
    }

    /// Re-evaluates the window and applies the new rate to the limiter.
    /// Returns the rate in effect afterwards.
    pub fn evaluate(&mut self) -> u64 {
        if self.samples.is_empty() {
            return self.rate;
        }

        let congested = self
            .samples
            .iter()
            .any(|&latency| latency > self.ping_threshold);

        if congested {
            self.rate = ((self.rate as f64 * self.decrease) as u64).max(self.floor);
        } else {
            self.rate = self.rate + ((self.rate as f64 * self.increase) as u64).max(1);
        }

        self.samples.clear();
        self.limiter.set_rate(self.rate);
        self.rate
    }

    pub fn current_rate(&self) -> u64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_allows_burst_then_throttles() {
        let limiter = UploadLimiter::new(100_000);

        // The bucket starts full with two seconds of tokens.
        assert_eq!(limiter.try_take(150_000), Duration::ZERO);
        assert_eq!(limiter.try_take(50_000), Duration::ZERO);

        // Empty bucket: the next take must wait for refill.
        let wait = limiter.try_take(100_000);
        assert!(wait > Duration::from_millis(900));
        assert!(wait < Duration::from_millis(1100));
    }

    #[test]
    fn zero_rate_never_blocks() {
        let limiter = UploadLimiter::new(0);
        assert_eq!(limiter.try_take(usize::MAX / 2), Duration::ZERO);
        assert_eq!(limiter.rate(), None);
    }

    #[test]
    fn set_rate_caps_accumulated_tokens() {
        let limiter = UploadLimiter::new(1_000_000);
        limiter.set_rate(10_000);
        // At most two seconds of the new rate survives.
        assert_eq!(limiter.try_take(20_000), Duration::ZERO);
        assert!(limiter.try_take(20_000) > Duration::ZERO);
    }

    #[test]
    fn tuner_backs_off_on_congestion() {
        let config = SessionConfig {
            upload_limit: 100_000,
            ..Default::default()
        };
        let limiter = UploadLimiter::new(config.upload_limit);
        let mut tuner = UploadTuner::new(limiter.clone(), &config);

        tuner.record_probe(Duration::from_secs(3));
        let rate = tuner.evaluate();
        assert_eq!(rate, 80_000);
        assert_eq!(limiter.rate(), Some(80_000));
    }

    #[test]
    fn tuner_creeps_up_when_clean() {
        let config = SessionConfig {
            upload_limit: 100_000,
            ..Default::default()
        };
        let limiter = UploadLimiter::new(config.upload_limit);
        let mut tuner = UploadTuner::new(limiter, &config);

        tuner.record_probe(Duration::from_millis(20));
        let rate = tuner.evaluate();
        assert_eq!(rate, 105_000);
    }

    #[test]
    fn tuner_respects_floor() {
        let config = SessionConfig {
            upload_limit: 20_000,
            tune_floor: 18_000,
            ..Default::default()
        };
        let limiter = UploadLimiter::new(config.upload_limit);
        let mut tuner = UploadTuner::new(limiter, &config);

        for _ in 0..10 {
            tuner.record_probe(Duration::from_secs(5));
            tuner.evaluate();
        }
        assert_eq!(tuner.current_rate(), 18_000);
    }

    #[test]
    fn tuner_holds_rate_without_samples() {
        let config = SessionConfig {
            upload_limit: 50_000,
            ..Default::default()
        };
        let limiter = UploadLimiter::new(config.upload_limit);
        let mut tuner = UploadTuner::new(limiter, &config);
        assert_eq!(tuner.evaluate(), 50_000);
    }
}
