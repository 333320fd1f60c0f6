//! Short-lived cache of sessions whose sender is not yet trusted.
//!
//! During enrolment the server receives envelopes from endpoints whose public
//! keys it does not know yet. Opening such a session costs an RSA decryption,
//! so the result is remembered for a short TTL to stop a chatty unknown
//! endpoint from costing one RSA operation per envelope.
//!
//! Entries expire a fixed time after insertion. Hits do not extend the TTL,
//! so an attacker replaying one blob cannot keep an entry alive forever.
//! Expiry is lazy: checked on lookup, swept when the cache fills.
//!
//! An entry also remembers the key its signature was last rejected by, so a
//! source whose known key does not match pays for one verification per
//! session rather than one per envelope.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use rsa::RsaPublicKey;

use crate::cipher::CipherSession;

/// Default time-to-live.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// TTL map from encrypted key blob to unauthenticated session.
pub struct UnauthenticatedCache<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<Bytes, Entry<I>>,
}

struct Entry<I> {
    session: Arc<CipherSession>,
    inserted: I,
    rejected_by: Option<RsaPublicKey>,
}

impl<I> UnauthenticatedCache<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Cache with the given TTL holding at most `max_entries` sessions.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self { ttl, max_entries: max_entries.max(1), entries: HashMap::new() }
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Session for `blob` unless it has expired, with the key that last
    /// rejected its signature.
    pub fn get(
        &mut self,
        blob: &[u8],
        now: I,
    ) -> Option<(Arc<CipherSession>, Option<RsaPublicKey>)> {
        let entry = self.entries.get(blob)?;
        if now - entry.inserted >= self.ttl {
            self.entries.remove(blob);
            return None;
        }
        Some((entry.session.clone(), entry.rejected_by.clone()))
    }

    /// Store `session` under its encrypted key blob.
    ///
    /// `rejected_by` is the key its signature failed against, if any.
    pub fn insert(
        &mut self,
        session: Arc<CipherSession>,
        rejected_by: Option<RsaPublicKey>,
        now: I,
    ) {
        if self.entries.len() >= self.max_entries {
            self.sweep(now);
        }
        if self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(blob, _)| blob.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries
            .insert(session.encrypted_cipher().clone(), Entry { session, inserted: now, rejected_by });
    }

    /// Record that the signature for `blob` failed against `key`.
    pub fn mark_rejected(&mut self, blob: &[u8], key: RsaPublicKey) {
        if let Some(entry) = self.entries.get_mut(blob) {
            entry.rejected_by = Some(key);
        }
    }

    /// Forget `blob`.
    pub fn remove(&mut self, blob: &[u8]) {
        self.entries.remove(blob);
    }

    /// Drop every expired entry.
    pub fn sweep(&mut self, now: I) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now - entry.inserted < ttl);
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use std::{sync::OnceLock, time::Instant};

    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::{keys::KeyMaterial, stats::RsaStats};

    fn sessions() -> &'static Vec<Arc<CipherSession>> {
        static SESSIONS: OnceLock<Vec<Arc<CipherSession>>> = OnceLock::new();
        SESSIONS.get_or_init(|| {
            let mut rng = ChaCha20Rng::seed_from_u64(31);
            let local = KeyMaterial::generate(&mut rng, 1024).unwrap();
            let stats = RsaStats::default();
            (0..3)
                .map(|_| {
                    Arc::new(
                        CipherSession::negotiate(&local, local.public_key(), &mut rng, &stats)
                            .unwrap(),
                    )
                })
                .collect()
        })
    }

    #[test]
    fn entries_expire_without_extension_on_hit() {
        let s = sessions();
        let t0 = Instant::now();
        let mut cache = UnauthenticatedCache::new(Duration::from_secs(60), 10);
        cache.insert(s[0].clone(), None, t0);

        // Repeated hits do not push expiry out.
        for secs in [10, 30, 59] {
            assert!(cache.get(s[0].encrypted_cipher(), t0 + Duration::from_secs(secs)).is_some());
        }
        assert!(cache.get(s[0].encrypted_cipher(), t0 + Duration::from_secs(60)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn full_cache_sweeps_then_drops_oldest() {
        let s = sessions();
        let t0 = Instant::now();
        let mut cache = UnauthenticatedCache::new(Duration::from_secs(60), 2);
        cache.insert(s[0].clone(), None, t0);
        cache.insert(s[1].clone(), None, t0 + Duration::from_secs(1));
        cache.insert(s[2].clone(), None, t0 + Duration::from_secs(2));

        let now = t0 + Duration::from_secs(3);
        assert!(cache.get(s[0].encrypted_cipher(), now).is_none());
        assert!(cache.get(s[1].encrypted_cipher(), now).is_some());
        assert!(cache.get(s[2].encrypted_cipher(), now).is_some());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let s = sessions();
        let t0 = Instant::now();
        let mut cache = UnauthenticatedCache::new(Duration::from_secs(60), 10);
        cache.insert(s[0].clone(), None, t0);
        cache.insert(s[1].clone(), None, t0 + Duration::from_secs(30));
        cache.sweep(t0 + Duration::from_secs(61));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn rejecting_key_is_remembered() {
        let s = sessions();
        let t0 = Instant::now();
        let session = s[0].clone();
        let other = KeyMaterial::generate(&mut ChaCha20Rng::seed_from_u64(32), 1024).unwrap();
        let mut cache = UnauthenticatedCache::new(Duration::from_secs(60), 10);
        cache.insert(session.clone(), None, t0);

        let (_, rejected) = cache.get(session.encrypted_cipher(), t0).unwrap();
        assert!(rejected.is_none());

        cache.mark_rejected(session.encrypted_cipher(), other.public_key().clone());
        let (_, rejected) = cache.get(session.encrypted_cipher(), t0).unwrap();
        assert_eq!(rejected.as_ref(), Some(other.public_key()));
    }
}
