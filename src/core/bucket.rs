//! Token bucket shared by all flows of one user on one node
//!
//! Tokens are bytes. The bucket refills continuously at `rate` bytes per
//! second and holds at most one second worth of tokens. `take` reserves
//! tokens even when that drives the balance negative and reports how long
//! the caller has to wait for the deficit to be repaid, so concurrent flows
//! sharing the bucket are serialized fairly without a retry loop.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Convert a panel speed value (Mbps) to bytes per second
pub fn mbps_to_bytes_per_sec(mbps: u64) -> u64 {
    mbps.saturating_mul(1_000_000) / 8
}

#[derive(Debug)]
struct BucketState {
    rate: u64,
    capacity: f64,
    tokens: f64,
    last_update: Instant,
}

impl BucketState {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        let new_tokens = elapsed.as_secs_f64() * self.rate as f64;
        self.tokens = (self.tokens + new_tokens).min(self.capacity);
        self.last_update = now;
    }
}

/// Token-bucket rate limiter
#[derive(Debug)]
pub struct Bucket {
    state: Mutex<BucketState>,
}

impl Bucket {
    /// Create a full bucket refilling at `bytes_per_sec`
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec.max(1);
        Self {
            state: Mutex::new(BucketState {
                rate,
                capacity: rate as f64,
                tokens: rate as f64,
                last_update: Instant::now(),
            }),
        }
    }

    /// Refill rate in bytes per second
    pub fn rate(&self) -> u64 {
        self.state.lock().rate
    }

    /// Change the refill rate in place.
    ///
    /// Flows already holding this bucket pick up the new rate on their next
    /// reservation. The balance is clamped to the new capacity.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut state = self.state.lock();
        state.refill();
        let rate = bytes_per_sec.max(1);
        state.rate = rate;
        state.capacity = rate as f64;
        state.tokens = state.tokens.min(state.capacity);
    }

    /// Tokens currently available (negative while a deficit is outstanding)
    pub fn available(&self) -> i64 {
        let mut state = self.state.lock();
        state.refill();
        state.tokens.floor() as i64
    }

    /// Take `bytes` tokens only if they are available right now
    pub fn try_take(&self, bytes: u64) -> bool {
        let mut state = self.state.lock();
        state.refill();
        if state.tokens >= bytes as f64 {
            state.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }

    /// Reserve `bytes` tokens and return how long to wait before they are
    /// actually owned. Zero means no wait.
    pub fn take(&self, bytes: u64) -> Duration {
        if bytes == 0 {
            return Duration::ZERO;
        }
        let mut state = self.state.lock();
        state.refill();
        state.tokens -= bytes as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / state.rate as f64)
        }
    }

    /// Reserve `bytes` tokens and sleep until they are owned
    pub async fn wait(&self, bytes: u64) {
        let delay = self.take(bytes);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
