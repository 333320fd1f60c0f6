//! RSA key material and identity derivation.
//!
//! An identity is a stable name derived from a public key:
//!
//! ```text
//! "C." || hex(SHA-256(be_u32(len(n) + 1) || 0x00 || n)[..8])
//! ```
//!
//! where `n` is the big-endian public modulus. The prefix byte mirrors the
//! length-prefixed, sign-padded mpint encoding of the modulus, so identities
//! stay compatible with keys minted by other tooling.

use rand::{CryptoRng, RngCore};
use rsa::{
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
    pkcs1::{
        DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey,
        LineEnding,
    },
    traits::PublicKeyParts,
};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Identity prefix.
pub const IDENTITY_PREFIX: &str = "C.";

/// Smallest accepted modulus.
pub const MIN_KEY_BITS: usize = 1024;

/// Largest accepted modulus.
pub const MAX_KEY_BITS: usize = 8192;

/// Modulus size for newly generated keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Derive the identity of a public key.
pub fn identity_from_public_key(key: &RsaPublicKey) -> String {
    let n = key.n().to_bytes_be();
    let mut hasher = Sha256::new();
    hasher.update(((n.len() + 1) as u32).to_be_bytes());
    hasher.update([0u8]);
    hasher.update(&n);
    let digest = hasher.finalize();
    format!("{IDENTITY_PREFIX}{}", hex::encode(&digest[..8]))
}

/// Reject moduli outside the supported range.
pub fn check_key_size(key: &RsaPublicKey) -> Result<(), CryptoError> {
    let bits = key.size() * 8;
    if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
        return Err(CryptoError::UnsupportedKeySize { bits });
    }
    Ok(())
}

/// Parse a PKCS#1 `RSA PUBLIC KEY` PEM block.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    let key = RsaPublicKey::from_pkcs1_pem(pem.trim())
        .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
    check_key_size(&key)?;
    Ok(key)
}

/// Encode a public key as a PKCS#1 PEM block.
pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, CryptoError> {
    key.to_pkcs1_pem(LineEnding::LF).map_err(|e| CryptoError::KeyEncoding(e.to_string()))
}

/// SHA-256 / PKCS#1 v1.5 signature check.
pub(crate) fn verify_sha256(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let digest = Sha256::digest(message);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature).is_ok()
}

/// A local RSA keypair and its derived identity.
///
/// # Invariants
///
/// - `identity` is computed once, from `public`, at construction
/// - `public` is the public half of `private`
///
/// # Security
///
/// The private key is zeroized on drop (`RsaPrivateKey` implements
/// `ZeroizeOnDrop`). `Debug` prints the identity only.
#[derive(Clone)]
pub struct KeyMaterial {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    identity: String,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").field("identity", &self.identity).finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Generate a fresh keypair.
    ///
    /// # Errors
    ///
    /// - `CryptoError::UnsupportedKeySize` if `bits` is out of range
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, bits: usize) -> Result<Self, CryptoError> {
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
            return Err(CryptoError::UnsupportedKeySize { bits });
        }
        let private = RsaPrivateKey::new(rng, bits).map_err(|e| CryptoError::Rsa(e.to_string()))?;
        Self::from_private_key(private)
    }

    /// Wrap an existing private key.
    pub fn from_private_key(private: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public = private.to_public_key();
        check_key_size(&public)?;
        let identity = identity_from_public_key(&public);
        Ok(Self { private, public, identity })
    }

    /// Parse a PKCS#1 `RSA PRIVATE KEY` PEM block.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs1_pem(pem.trim())
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Self::from_private_key(private)
    }

    /// Encode the private key as a PKCS#1 PEM block.
    pub fn to_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        self.private.to_pkcs1_pem(LineEnding::LF).map_err(|e| CryptoError::KeyEncoding(e.to_string()))
    }

    /// Encode the public key as a PKCS#1 PEM block.
    pub fn public_key_pem(&self) -> Result<String, CryptoError> {
        public_key_to_pem(&self.public)
    }

    /// Identity derived from the public key.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Public half.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        self.public.size() * 8
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// SHA-256 / PKCS#1 v1.5 signature over `message`.
    pub(crate) fn sign_sha256(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = Sha256::digest(message);
        self.private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| CryptoError::Rsa(e.to_string()))
    }
}
