//! Secure session protocol for fleetlink.
//!
//! Hybrid encryption between endpoints and the server over an untrusted
//! network with no pre-shared session state:
//!
//! - Each side holds an RSA keypair ([`KeyMaterial`]); identities are derived
//!   from the public modulus.
//! - A sender negotiates a [`CipherSession`] per peer: fresh AES-128 and HMAC
//!   keys, RSA-OAEP encrypted to the peer and signed with the sender's key.
//! - Every envelope is AES-128-CBC encrypted with a fresh packet IV and
//!   protected by HMAC-SHA1.
//! - [`CryptoManager`] caches sessions in both directions so steady-state
//!   traffic costs no asymmetric operations at all. Once a peer's signature
//!   has been verified for a session key blob, later envelopes carrying the
//!   same blob are authenticated by HMAC equality alone.
//!
//! # Security
//!
//! There is no forward secrecy: compromise of a private key exposes every
//! session key ever sent to it.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cache;
pub mod cipher;
pub mod error;
pub mod keys;
pub mod limiter;
pub mod manager;
pub mod resolver;
pub mod rng;
pub mod stats;
pub mod unauthenticated;

pub use cache::CipherCache;
pub use cipher::CipherSession;
pub use error::CryptoError;
pub use keys::{KeyMaterial, identity_from_public_key};
pub use limiter::RateLimiter;
pub use manager::{CryptoConfig, CryptoManager, MessageInfo};
pub use resolver::{DirectoryResolver, InMemoryResolver, PublicKeyResolver};
pub use rng::EnvRng;
pub use stats::{RsaStats, RsaStatsSnapshot};
pub use unauthenticated::UnauthenticatedCache;
