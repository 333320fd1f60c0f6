//! Environment abstraction for deterministic testing.
//!
//! Session negotiation needs randomness (keys, IVs, OAEP padding) and the
//! delivery pipeline needs time (poll intervals, backoff, liveness deadlines,
//! cache TTLs). Routing both through this trait lets tests run the whole
//! pipeline on a paused clock with a seeded RNG.

use std::time::Duration;

/// Time, randomness and sleeping.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    ///
    /// Production uses `std::time::Instant`; tests use an instant that follows
    /// a paused clock.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    ///
    /// # Invariants
    ///
    /// - Subsequent calls return times >= previous calls.
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only drivers sleep. State machines take `now` as an argument instead.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Wall clock time in microseconds since the Unix epoch.
    ///
    /// Used only for informational timestamps, never for deadlines.
    fn wall_clock_micros(&self) -> u64;

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Uniformly random duration in `[0, max]` at millisecond resolution.
    ///
    /// Used to spread retries from many endpoints over a window.
    fn jitter(&self, max: Duration) -> Duration {
        let millis = max.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.random_u64() % (millis + 1))
    }
}
