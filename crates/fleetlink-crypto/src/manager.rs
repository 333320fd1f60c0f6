//! Envelope encryption and decryption with session caching.
//!
//! [`CryptoManager`] is an explicitly constructed service object; callers
//! share it behind an `Arc`. All methods take `&self` and are safe to call
//! concurrently. Each cache sits behind its own mutex and no lock is held
//! across an RSA operation or an await point.
//!
//! # Decrypt pipeline
//!
//! ```text
//! parse envelope ── no key blob ──────────────────────────> empty MessageInfo
//!       │
//!       ├─ blob in CipherCache ──────> HMAC ──> payload          (0 RSA ops)
//!       │
//!       ├─ blob in UnauthenticatedCache ──> HMAC ──> [verify if the source
//!       │                    has a key not yet tried] ──> payload
//!       │
//!       └─ unknown blob ──> rate limiter ──> RSA decrypt key blob ──> HMAC
//!                 ──> decrypt metadata ──> verify signature
//!                 ──> CipherCache (trusted) | UnauthenticatedCache ──> payload
//! ```

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use fleetlink_core::Environment;
use fleetlink_proto::{
    Compression, Envelope, IV_SIZE, Message, MessageList, PROTOCOL_VERSION, PackedMessageList,
};
use rsa::RsaPublicKey;

use crate::{
    cache::CipherCache,
    cipher::CipherSession,
    error::CryptoError,
    keys::{KeyMaterial, identity_from_public_key, parse_public_key_pem},
    limiter::{DEFAULT_BURST, DEFAULT_RATE_PER_SEC, RateLimiter},
    resolver::PublicKeyResolver,
    rng::EnvRng,
    stats::{RsaStats, RsaStatsSnapshot},
    unauthenticated::{DEFAULT_TTL, UnauthenticatedCache},
};

/// Session protocol tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoConfig {
    /// Peers kept in the session cache; size to the expected fleet
    pub cache_capacity: usize,
    /// Lifetime of unauthenticated sessions
    pub unauthenticated_ttl: Duration,
    /// Maximum unauthenticated sessions remembered
    pub unauthenticated_capacity: usize,
    /// Sustained RSA decryptions per second for unknown sessions (0 = no limit)
    pub rsa_decrypts_per_sec: u32,
    /// RSA decryption burst
    pub rsa_decrypt_burst: u32,
    /// Deployment nonce stamped into every packed message list
    pub nonce: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            unauthenticated_ttl: DEFAULT_TTL,
            unauthenticated_capacity: 10_000,
            rsa_decrypts_per_sec: DEFAULT_RATE_PER_SEC,
            rsa_decrypt_burst: DEFAULT_BURST,
            nonce: String::new(),
        }
    }
}

/// Result of decrypting an envelope.
///
/// The payload is still compressed; call [`MessageInfo::messages`] to decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageInfo {
    /// Identity that negotiated the session
    pub source: String,
    /// True if the session signature was verified against a trusted key
    pub authenticated: bool,
    /// Sender's protocol version
    pub protocol_version: u32,
    /// Decrypted plaintext
    pub packed: PackedMessageList,
}

impl MessageInfo {
    /// True for the result of an envelope without a session key blob.
    pub fn is_empty(&self) -> bool {
        self.source.is_empty() && self.packed.message_list.is_empty()
    }

    /// Decompress and decode the carried messages.
    pub fn messages(&self) -> Result<Vec<Message>, CryptoError> {
        self.packed.messages().map_err(|e| CryptoError::Serialization(e.to_string()))
    }

    /// Fail unless the sender was authenticated.
    pub fn require_authenticated(&self) -> Result<(), CryptoError> {
        if self.authenticated { Ok(()) } else { Err(CryptoError::NotTrusted(self.source.clone())) }
    }
}

/// Hybrid RSA/AES envelope encryption with cached sessions.
pub struct CryptoManager<E: Environment> {
    env: E,
    local: KeyMaterial,
    resolver: Arc<dyn PublicKeyResolver>,
    config: CryptoConfig,
    ciphers: Mutex<CipherCache>,
    unauthenticated: Mutex<UnauthenticatedCache<E::Instant>>,
    limiter: RateLimiter<E>,
    stats: RsaStats,
}

impl<E: Environment> CryptoManager<E> {
    /// Build a manager for `local`, trusting keys known to `resolver`.
    pub fn new(
        env: E,
        local: KeyMaterial,
        resolver: Arc<dyn PublicKeyResolver>,
        config: CryptoConfig,
    ) -> Self {
        tracing::debug!(identity = %local.identity(), "crypto manager created");
        Self {
            limiter: RateLimiter::new(
                env.clone(),
                config.rsa_decrypts_per_sec,
                config.rsa_decrypt_burst,
            ),
            ciphers: Mutex::new(CipherCache::new(config.cache_capacity)),
            unauthenticated: Mutex::new(UnauthenticatedCache::new(
                config.unauthenticated_ttl,
                config.unauthenticated_capacity,
            )),
            env,
            local,
            resolver,
            config,
            stats: RsaStats::default(),
        }
    }

    /// Local identity.
    pub fn identity(&self) -> &str {
        self.local.identity()
    }

    /// Local key material.
    pub fn key_material(&self) -> &KeyMaterial {
        &self.local
    }

    /// RSA operation counters.
    pub fn stats(&self) -> RsaStatsSnapshot {
        self.stats.snapshot()
    }

    /// Peers currently in the session cache.
    pub fn cached_peers(&self) -> usize {
        self.ciphers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Encrypt pre-compressed chunks for `destination`.
    ///
    /// Reuses the cached outbound session for `destination` if there is one;
    /// otherwise resolves the destination's key and negotiates a new session
    /// (one RSA signature and one RSA encryption), caching it for next time.
    ///
    /// # Errors
    ///
    /// - `CryptoError::NoPublicKey` if no session is cached and the resolver
    ///   does not know `destination`
    pub fn encrypt(
        &self,
        chunks: Vec<Bytes>,
        compression: Compression,
        destination: &str,
    ) -> Result<Bytes, CryptoError> {
        let session = self.outbound_session(destination)?;

        let packed = PackedMessageList {
            compression,
            message_list: chunks,
            nonce: self.config.nonce.clone(),
            timestamp: self.env.wall_clock_micros(),
        };
        let plaintext = packed.encode()?;

        let mut packet_iv = [0u8; IV_SIZE];
        self.env.random_bytes(&mut packet_iv);

        let envelope = session.seal(&plaintext, packet_iv, PROTOCOL_VERSION)?;
        Ok(envelope.to_bytes()?)
    }

    /// Encode, compress and encrypt message lists as a single chunk.
    pub fn encrypt_messages(
        &self,
        lists: &[MessageList],
        compression: Compression,
        destination: &str,
    ) -> Result<Bytes, CryptoError> {
        let mut raw = Vec::new();
        for list in lists {
            raw.extend(list.encode_record()?);
        }
        let chunk = Bytes::from(compression.compress(&raw)?);
        self.encrypt(vec![chunk], compression, destination)
    }

    fn outbound_session(&self, destination: &str) -> Result<Arc<CipherSession>, CryptoError> {
        if let Some(session) =
            self.ciphers.lock().unwrap_or_else(PoisonError::into_inner).outbound(destination)
        {
            return Ok(session);
        }

        let peer_key = self
            .resolver
            .get(destination)?
            .ok_or_else(|| CryptoError::NoPublicKey(destination.to_string()))?;

        let session = Arc::new(CipherSession::negotiate(
            &self.local,
            &peer_key,
            &mut EnvRng(&self.env),
            &self.stats,
        )?);
        tracing::debug!(%destination, "negotiated outbound session");

        self.ciphers.lock().unwrap_or_else(PoisonError::into_inner).put(
            destination,
            None,
            Some(session.clone()),
        );
        Ok(session)
    }

    /// Decrypt an envelope.
    ///
    /// An envelope without a key blob yields an empty [`MessageInfo`]. A
    /// sender whose key is unknown, or whose signature fails, still gets its
    /// message decrypted but marked `authenticated = false`.
    ///
    /// May wait on the RSA rate limiter. Cancel by dropping the future.
    ///
    /// # Errors
    ///
    /// Every error is fatal for the envelope ([`CryptoError::is_fatal`]):
    /// malformed structure, key blob not decryptable, HMAC mismatch, bad
    /// padding.
    pub async fn decrypt(&self, data: &[u8]) -> Result<MessageInfo, CryptoError> {
        let envelope = Envelope::decode(data)?;
        if !envelope.has_cipher() {
            return Ok(MessageInfo::default());
        }

        let session = match self.cached_session(&envelope)? {
            Some(session) => session,
            None => self.open_session(&envelope).await?,
        };

        let plaintext = session.unseal(&envelope)?;
        let packed = PackedMessageList::decode(&plaintext)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;

        Ok(MessageInfo {
            source: session.source().to_string(),
            authenticated: session.is_authenticated(),
            protocol_version: envelope.protocol_version,
            packed,
        })
    }

    /// Session for an already-seen key blob, verified against the envelope.
    fn cached_session(&self, envelope: &Envelope) -> Result<Option<Arc<CipherSession>>, CryptoError> {
        let blob = &envelope.encrypted_cipher;

        let trusted =
            self.ciphers.lock().unwrap_or_else(PoisonError::into_inner).get_by_encrypted_blob(blob);
        if let Some(session) = trusted {
            return Ok(Some(session));
        }

        let untrusted = self
            .unauthenticated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(blob, self.env.now());
        let Some((session, rejected_by)) = untrusted else {
            return Ok(None);
        };

        // Check integrity before spending a verification on a forged copy.
        session.unseal(envelope)?;
        Ok(Some(self.try_promote(session, rejected_by.as_ref())?))
    }

    /// Upgrade an unauthenticated session if its source has become known.
    ///
    /// Verifies at most once per resolved key: a key that already rejected
    /// the signature is not tried again.
    fn try_promote(
        &self,
        session: Arc<CipherSession>,
        rejected_by: Option<&RsaPublicKey>,
    ) -> Result<Arc<CipherSession>, CryptoError> {
        let Some(key) = self.resolver.get(session.source())? else {
            return Ok(session);
        };
        if rejected_by == Some(&key) {
            return Ok(session);
        }
        if !session.verify(&key, &self.stats) {
            tracing::debug!(source = %session.source(), "signature rejected by known key");
            self.unauthenticated
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .mark_rejected(session.encrypted_cipher(), key);
            return Ok(session);
        }

        let promoted = Arc::new(session.authenticated_copy());
        self.unauthenticated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session.encrypted_cipher());
        self.ciphers.lock().unwrap_or_else(PoisonError::into_inner).put(
            promoted.source(),
            Some(promoted.clone()),
            None,
        );
        tracing::debug!(source = %promoted.source(), "promoted session to authenticated");
        Ok(promoted)
    }

    /// Full RSA path for a key blob we have never seen.
    async fn open_session(&self, envelope: &Envelope) -> Result<Arc<CipherSession>, CryptoError> {
        self.limiter.acquire().await;

        let session = CipherSession::open(&self.local, envelope, &self.stats).inspect_err(|e| {
            tracing::debug!(error = %e, "failed to open session");
        })?;

        let key = self.resolver.get(session.source())?;
        let trusted = key.as_ref().is_some_and(|key| session.verify(key, &self.stats));

        if trusted {
            let session = Arc::new(session.authenticated_copy());
            self.ciphers.lock().unwrap_or_else(PoisonError::into_inner).put(
                session.source(),
                Some(session.clone()),
                None,
            );
            Ok(session)
        } else {
            tracing::debug!(source = %session.source(), "session from untrusted source");
            let session = Arc::new(session);
            self.unauthenticated
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(session.clone(), key, self.env.now());
            Ok(session)
        }
    }

    /// Trust `key_pem` for `claimed_identity` (enrolment).
    ///
    /// # Errors
    ///
    /// - `CryptoError::IdentityMismatch` unless the key derives to the claim,
    ///   so an endpoint cannot enrol under someone else's identity
    pub fn register_peer_key(&self, claimed_identity: &str, key_pem: &str) -> Result<(), CryptoError> {
        let key = parse_public_key_pem(key_pem)?;
        let derived = identity_from_public_key(&key);
        if derived != claimed_identity {
            return Err(CryptoError::IdentityMismatch {
                claimed: claimed_identity.to_string(),
                derived,
            });
        }
        self.resolver.add(&derived, &key)?;
        tracing::info!(identity = %derived, "registered peer key");
        Ok(())
    }

    /// Trust a server key fetched from `<url>/server.pem`.
    ///
    /// Returns the identity the key derives to. Any cached session for that
    /// identity is dropped so the next envelope negotiates against the new key.
    ///
    /// # Errors
    ///
    /// - `CryptoError::IdentityMismatch` if `pinned` is set and the key derives
    ///   to a different identity; the key is not installed
    pub fn add_server_key(&self, key_pem: &str, pinned: Option<&str>) -> Result<String, CryptoError> {
        let key = parse_public_key_pem(key_pem)?;
        let identity = identity_from_public_key(&key);
        if let Some(pinned) = pinned
            && pinned != identity
        {
            return Err(CryptoError::IdentityMismatch { claimed: pinned.to_string(), derived: identity });
        }
        let unchanged = self.resolver.get(&identity)?.is_some_and(|existing| existing == key);
        if !unchanged {
            self.resolver.add(&identity, &key)?;
            self.ciphers.lock().unwrap_or_else(PoisonError::into_inner).delete(&identity);
            tracing::info!(%identity, "installed server key");
        }
        Ok(identity)
    }

    /// Forget `identity`: cached sessions and trusted key.
    pub fn delete_subject(&self, identity: &str) -> Result<(), CryptoError> {
        self.ciphers.lock().unwrap_or_else(PoisonError::into_inner).delete(identity);
        self.resolver.remove(identity)
    }

    /// Forget every session and trusted key.
    pub fn clear(&self) -> Result<(), CryptoError> {
        self.ciphers.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.unauthenticated.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.resolver.clear()
    }
}
