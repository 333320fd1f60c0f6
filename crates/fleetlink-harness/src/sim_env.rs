//! Seeded simulation environment.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use fleetlink_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Wall clock reported at the simulation start: 2024-01-01T00:00:00Z.
const EPOCH_MICROS: u64 = 1_704_067_200_000_000;

/// Deterministic [`Environment`].
///
/// Randomness comes from a ChaCha20 stream seeded at construction; clones
/// share the stream. Time follows `tokio::time`, so under
/// `#[tokio::test(start_paused = true)]` sleeps complete instantly and in
/// order.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    start: tokio::time::Instant,
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }

    fn wall_clock_micros(&self) -> u64 {
        EPOCH_MICROS + (self.now() - self.start).as_micros() as u64
    }
}
