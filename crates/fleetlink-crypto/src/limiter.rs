//! Token bucket guarding expensive RSA decryptions.
//!
//! Opening an unknown session costs an RSA private-key operation. A flood of
//! bogus envelopes with random key blobs would otherwise turn into a CPU
//! exhaustion attack, so callers wait for a token first. Waiting is a bounded
//! delay, not a failure.
//!
//! The bucket holds up to `burst` tokens and refills continuously at
//! `rate_per_sec`. A rate of zero disables limiting.

use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use fleetlink_core::Environment;

/// Default sustained rate.
pub const DEFAULT_RATE_PER_SEC: u32 = 100;

/// Default burst.
pub const DEFAULT_BURST: u32 = 100;

struct Bucket<I> {
    tokens: f64,
    last_refill: I,
}

/// Async token bucket driven by an [`Environment`] clock.
pub struct RateLimiter<E: Environment> {
    env: E,
    rate_per_sec: u32,
    burst: u32,
    bucket: Mutex<Bucket<E::Instant>>,
}

impl<E: Environment> RateLimiter<E> {
    /// Full bucket of `burst` tokens refilling at `rate_per_sec`.
    pub fn new(env: E, rate_per_sec: u32, burst: u32) -> Self {
        let burst = burst.max(1);
        let now = env.now();
        Self {
            env,
            rate_per_sec,
            burst,
            bucket: Mutex::new(Bucket { tokens: f64::from(burst), last_refill: now }),
        }
    }

    /// Take a token if one is available.
    pub fn try_acquire(&self) -> bool {
        self.try_take().is_none()
    }

    /// Wait until a token is available and take it.
    ///
    /// Cancel by dropping the future; no token is consumed in that case.
    pub async fn acquire(&self) {
        let mut waited = Duration::ZERO;
        while let Some(wait) = self.try_take() {
            waited += wait;
            self.env.sleep(wait).await;
        }
        if !waited.is_zero() {
            tracing::debug!(?waited, "RSA decrypt rate limited");
        }
    }

    /// Take a token, or return how long until one is available.
    fn try_take(&self) -> Option<Duration> {
        if self.rate_per_sec == 0 {
            return None;
        }
        let now = self.env.now();
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);

        let elapsed = if now > bucket.last_refill { now - bucket.last_refill } else { Duration::ZERO };
        let refill = elapsed.as_secs_f64() * f64::from(self.rate_per_sec);
        bucket.tokens = (bucket.tokens + refill).min(f64::from(self.burst));
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - bucket.tokens;
            let secs = missing / f64::from(self.rate_per_sec);
            Some(Duration::from_secs_f64(secs).max(Duration::from_millis(1)))
        }
    }
}
