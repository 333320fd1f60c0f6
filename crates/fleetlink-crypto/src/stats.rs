//! Counters for expensive RSA operations.
//!
//! Session caching exists to keep these counters flat in steady state. A
//! climbing `decrypt` count on a server usually means endpoints are losing
//! their cached sessions (restarts, cache too small for the fleet).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters.
#[derive(Debug, Default)]
pub struct RsaStats {
    sign: AtomicU64,
    verify: AtomicU64,
    encrypt: AtomicU64,
    decrypt: AtomicU64,
}

/// Point-in-time copy of [`RsaStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RsaStatsSnapshot {
    /// Session signatures created
    pub sign: u64,
    /// Session signatures checked
    pub verify: u64,
    /// Key blobs encrypted to a peer
    pub encrypt: u64,
    /// Key blobs decrypted
    pub decrypt: u64,
}

impl RsaStatsSnapshot {
    /// Sum of all operations.
    pub fn total(&self) -> u64 {
        self.sign + self.verify + self.encrypt + self.decrypt
    }
}

impl RsaStats {
    pub(crate) fn record_sign(&self) {
        self.sign.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_verify(&self) {
        self.verify.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_encrypt(&self) {
        self.encrypt.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decrypt(&self) {
        self.decrypt.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values.
    pub fn snapshot(&self) -> RsaStatsSnapshot {
        RsaStatsSnapshot {
            sign: self.sign.load(Ordering::Relaxed),
            verify: self.verify.load(Ordering::Relaxed),
            encrypt: self.encrypt.load(Ordering::Relaxed),
            decrypt: self.decrypt.load(Ordering::Relaxed),
        }
    }
}
