//! Session ciphers and the symmetric envelope layer.
//!
//! A session is negotiated by the sender:
//!
//! 1. Draw a fresh AES-128 key, metadata IV and HMAC key.
//! 2. Serialize them (the key blob plaintext) and sign the serialization with
//!    the sender's RSA key (SHA-256, PKCS#1 v1.5).
//! 3. RSA-OAEP (SHA-1) encrypt the key blob to the recipient's public key.
//! 4. AES encrypt `{source identity, signature}` under the session key and
//!    metadata IV.
//!
//! The encrypted key blob and encrypted metadata are reused verbatim in every
//! envelope of the session, which is what lets the receiver recognise a
//! session it has already opened without any RSA work.
//!
//! Key blob plaintext layout:
//!
//! ```text
//! version u8 | hmac_type u8 | key[16] | metadata_iv[16] | hmac_key[16]
//! ```

use aes::Aes128;
use bytes::{BufMut, Bytes};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use fleetlink_proto::{Envelope, HMAC_SIZE, IV_SIZE};
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    keys::{KeyMaterial, verify_sha256},
    stats::RsaStats,
};

/// AES-128 key size.
pub const KEY_SIZE: usize = 16;

/// AES block size.
pub const BLOCK_SIZE: usize = 16;

const PROPERTIES_VERSION: u8 = 1;
const HMAC_TYPE_FULL: u8 = 1;
const PROPERTIES_SIZE: usize = 2 + KEY_SIZE + IV_SIZE + KEY_SIZE;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// Symmetric secrets of one session.
#[derive(Clone)]
struct CipherProperties {
    key: [u8; KEY_SIZE],
    metadata_iv: [u8; IV_SIZE],
    hmac_key: [u8; KEY_SIZE],
}

impl Drop for CipherProperties {
    fn drop(&mut self) {
        self.key.zeroize();
        self.metadata_iv.zeroize();
        self.hmac_key.zeroize();
    }
}

impl CipherProperties {
    fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut props =
            Self { key: [0; KEY_SIZE], metadata_iv: [0; IV_SIZE], hmac_key: [0; KEY_SIZE] };
        rng.fill_bytes(&mut props.key);
        rng.fill_bytes(&mut props.metadata_iv);
        rng.fill_bytes(&mut props.hmac_key);
        props
    }

    fn encode(&self) -> zeroize::Zeroizing<Vec<u8>> {
        let mut out = zeroize::Zeroizing::new(Vec::with_capacity(PROPERTIES_SIZE));
        out.push(PROPERTIES_VERSION);
        out.push(HMAC_TYPE_FULL);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.metadata_iv);
        out.extend_from_slice(&self.hmac_key);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PROPERTIES_SIZE {
            return Err(CryptoError::InvalidCipher("key blob has wrong length"));
        }
        if bytes[0] != PROPERTIES_VERSION {
            return Err(CryptoError::InvalidCipher("unknown key blob version"));
        }
        if bytes[1] != HMAC_TYPE_FULL {
            return Err(CryptoError::InvalidCipher("unsupported HMAC type"));
        }
        let mut props =
            Self { key: [0; KEY_SIZE], metadata_iv: [0; IV_SIZE], hmac_key: [0; KEY_SIZE] };
        props.key.copy_from_slice(&bytes[2..2 + KEY_SIZE]);
        props.metadata_iv.copy_from_slice(&bytes[2 + KEY_SIZE..2 + KEY_SIZE + IV_SIZE]);
        props.hmac_key.copy_from_slice(&bytes[2 + KEY_SIZE + IV_SIZE..]);
        Ok(props)
    }
}

/// Decrypted session metadata.
struct CipherMetadata {
    source: String,
    signature: Vec<u8>,
}

impl CipherMetadata {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.source.len() + self.signature.len());
        out.put_u16(self.source.len() as u16);
        out.put_slice(self.source.as_bytes());
        out.put_u16(self.signature.len() as u16);
        out.put_slice(&self.signature);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        let malformed = CryptoError::InvalidCipher("malformed session metadata");
        let (source, rest) = split_u16_prefixed(bytes).ok_or(malformed.clone())?;
        let (signature, rest) = split_u16_prefixed(rest).ok_or(malformed.clone())?;
        if !rest.is_empty() {
            return Err(malformed);
        }
        let source = std::str::from_utf8(source)
            .map_err(|_| CryptoError::InvalidCipher("source is not UTF-8"))?
            .to_string();
        Ok(Self { source, signature: signature.to_vec() })
    }
}

fn split_u16_prefixed(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let len = usize::from(u16::from_be_bytes([*bytes.first()?, *bytes.get(1)?]));
    let rest = bytes.get(2..)?;
    (rest.len() >= len).then(|| rest.split_at(len))
}

/// A negotiated symmetric key bundle and its wire representation.
///
/// # Invariants
///
/// - Immutable after creation. An unauthenticated session is never upgraded
///   in place; verification produces a new, authenticated session
///   ([`CipherSession::authenticated_copy`]).
/// - `encrypted_cipher` and `encrypted_metadata` are exactly the bytes every
///   envelope of this session carries.
#[derive(Clone)]
pub struct CipherSession {
    properties: CipherProperties,
    source: String,
    signature: Vec<u8>,
    encrypted_cipher: Bytes,
    encrypted_metadata: Bytes,
    authenticated: bool,
}

impl std::fmt::Debug for CipherSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSession")
            .field("source", &self.source)
            .field("authenticated", &self.authenticated)
            .field("encrypted_cipher_len", &self.encrypted_cipher.len())
            .finish_non_exhaustive()
    }
}

impl CipherSession {
    /// Negotiate a fresh outbound session from `local` to the owner of
    /// `peer_key`.
    ///
    /// Costs one RSA signature and one RSA encryption.
    pub fn negotiate<R: RngCore + CryptoRng>(
        local: &KeyMaterial,
        peer_key: &RsaPublicKey,
        rng: &mut R,
        stats: &RsaStats,
    ) -> Result<Self, CryptoError> {
        let properties = CipherProperties::random(rng);
        let plaintext = properties.encode();

        let signature = local.sign_sha256(&plaintext)?;
        stats.record_sign();

        let encrypted_cipher = peer_key
            .encrypt(rng, Oaep::new::<Sha1>(), &plaintext)
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        stats.record_encrypt();

        let metadata =
            CipherMetadata { source: local.identity().to_string(), signature: signature.clone() };
        let encrypted_metadata =
            encrypt_symmetric(&properties.key, &properties.metadata_iv, &metadata.encode())?;

        Ok(Self {
            properties,
            source: local.identity().to_string(),
            signature,
            encrypted_cipher: Bytes::from(encrypted_cipher),
            encrypted_metadata: Bytes::from(encrypted_metadata),
            authenticated: true,
        })
    }

    /// Recover the session carried by an inbound envelope.
    ///
    /// Costs one RSA decryption. Checks the metadata IV binding and the
    /// envelope HMAC before touching the metadata. The returned session is
    /// unauthenticated until [`CipherSession::verify`] succeeds.
    pub fn open(
        local: &KeyMaterial,
        envelope: &Envelope,
        stats: &RsaStats,
    ) -> Result<Self, CryptoError> {
        stats.record_decrypt();
        let plaintext = zeroize::Zeroizing::new(
            local
                .private_key()
                .decrypt(Oaep::new::<Sha1>(), &envelope.encrypted_cipher)
                .map_err(|_| CryptoError::KeyDecryption)?,
        );
        let properties = CipherProperties::decode(&plaintext)?;

        let mut session = Self {
            properties,
            source: String::new(),
            signature: Vec::new(),
            encrypted_cipher: envelope.encrypted_cipher.clone(),
            encrypted_metadata: envelope.encrypted_metadata.clone(),
            authenticated: false,
        };
        session.check_envelope(envelope)?;

        let metadata = decrypt_symmetric(
            &session.properties.key,
            &session.properties.metadata_iv,
            &envelope.encrypted_metadata,
        )?;
        let metadata = CipherMetadata::decode(&metadata)?;
        session.source = metadata.source;
        session.signature = metadata.signature;
        Ok(session)
    }

    /// Check the session signature against the claimed source's key.
    ///
    /// Costs one RSA verification.
    pub fn verify(&self, source_key: &RsaPublicKey, stats: &RsaStats) -> bool {
        stats.record_verify();
        verify_sha256(source_key, &self.properties.encode(), &self.signature)
    }

    /// Same session, marked authenticated.
    pub fn authenticated_copy(&self) -> Self {
        Self { authenticated: true, ..self.clone() }
    }

    /// Identity that negotiated the session.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True once the signature has been verified.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// RSA-encrypted key blob.
    pub fn encrypted_cipher(&self) -> &Bytes {
        &self.encrypted_cipher
    }

    /// Encrypted metadata blob.
    pub fn encrypted_metadata(&self) -> &Bytes {
        &self.encrypted_metadata
    }

    /// Seal `plaintext` into an envelope with a fresh packet IV.
    pub fn seal(&self, plaintext: &[u8], packet_iv: [u8; IV_SIZE], protocol_version: u32) -> Result<Envelope, CryptoError> {
        let encrypted_payload = encrypt_symmetric(&self.properties.key, &packet_iv, plaintext)?;
        let mut envelope = Envelope {
            encrypted_cipher: self.encrypted_cipher.clone(),
            encrypted_metadata: self.encrypted_metadata.clone(),
            metadata_iv: self.properties.metadata_iv,
            encrypted_payload: Bytes::from(encrypted_payload),
            packet_iv,
            protocol_version,
            full_hmac: [0; HMAC_SIZE],
        };
        envelope.full_hmac = compute_hmac(&self.properties.hmac_key, &envelope)?;
        Ok(envelope)
    }

    /// Verify an envelope belongs to this session and decrypt its payload.
    ///
    /// Never returns partial plaintext: integrity is checked first.
    pub fn unseal(&self, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
        self.check_envelope(envelope)?;
        decrypt_symmetric(&self.properties.key, &envelope.packet_iv, &envelope.encrypted_payload)
    }

    fn check_envelope(&self, envelope: &Envelope) -> Result<(), CryptoError> {
        if envelope.metadata_iv != self.properties.metadata_iv {
            return Err(CryptoError::Integrity("metadata IV does not match session"));
        }
        verify_hmac(&self.properties.hmac_key, envelope)
    }
}

/// HMAC-SHA1 over [`Envelope::authenticated_bytes`].
pub fn compute_hmac(hmac_key: &[u8], envelope: &Envelope) -> Result<[u8; HMAC_SIZE], CryptoError> {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(hmac_key)
        .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: hmac_key.len() })?;
    mac.update(&envelope.authenticated_bytes());
    let mut out = [0u8; HMAC_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time HMAC check.
pub fn verify_hmac(hmac_key: &[u8], envelope: &Envelope) -> Result<(), CryptoError> {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(hmac_key)
        .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: hmac_key.len() })?;
    mac.update(&envelope.authenticated_bytes());
    mac.verify_slice(&envelope.full_hmac).map_err(|_| CryptoError::Integrity("HMAC mismatch"))
}

/// AES-128-CBC with PKCS#7 padding.
///
/// # Errors
///
/// - `CryptoError::InvalidKeyLength` unless `key` is 16 bytes
pub fn encrypt_symmetric(key: &[u8], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: key.len() });
    }
    let pad = BLOCK_SIZE - plaintext.len() % BLOCK_SIZE;
    let mut padded = Vec::with_capacity(plaintext.len() + pad);
    padded.extend_from_slice(plaintext);
    padded.resize(plaintext.len() + pad, pad as u8);

    let encryptor = Aes128CbcEnc::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: key.len() })?;
    Ok(encryptor.encrypt_padded_vec_mut::<NoPadding>(&padded))
}

/// AES-128-CBC decryption with strict PKCS#7 validation.
///
/// # Errors
///
/// - `CryptoError::Padding` if the ciphertext is empty or not block aligned,
///   or if any padding byte differs from the padding length
pub fn decrypt_symmetric(key: &[u8], iv: &[u8; IV_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: key.len() });
    }
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::Padding);
    }

    let decryptor = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: key.len() })?;
    let mut plaintext =
        decryptor.decrypt_padded_vec_mut::<NoPadding>(ciphertext).map_err(|_| CryptoError::Padding)?;

    let pad = usize::from(*plaintext.last().ok_or(CryptoError::Padding)?);
    if pad == 0 || pad > BLOCK_SIZE || pad > plaintext.len() {
        return Err(CryptoError::Padding);
    }
    if plaintext[plaintext.len() - pad..].iter().any(|&b| usize::from(b) != pad) {
        return Err(CryptoError::Padding);
    }
    plaintext.truncate(plaintext.len() - pad);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::keys::MIN_KEY_BITS;

    fn keys() -> (KeyMaterial, KeyMaterial, ChaCha20Rng) {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let a = KeyMaterial::generate(&mut rng, MIN_KEY_BITS).unwrap();
        let b = KeyMaterial::generate(&mut rng, MIN_KEY_BITS).unwrap();
        (a, b, rng)
    }

    #[test]
    fn symmetric_padding_boundaries() {
        let key = [7u8; KEY_SIZE];
        let iv = [9u8; IV_SIZE];
        for len in [0, 1, 15, 16, 17, 32] {
            let plaintext = vec![0xAB; len];
            let ciphertext = encrypt_symmetric(&key, &iv, &plaintext).unwrap();
            assert_eq!(ciphertext.len(), (len / BLOCK_SIZE + 1) * BLOCK_SIZE);
            assert_eq!(decrypt_symmetric(&key, &iv, &ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        assert_eq!(
            encrypt_symmetric(&[0; 15], &[0; IV_SIZE], b"x"),
            Err(CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: 15 })
        );
    }

    #[test]
    fn misaligned_ciphertext_is_a_padding_error() {
        let key = [1u8; KEY_SIZE];
        assert_eq!(decrypt_symmetric(&key, &[0; IV_SIZE], &[0; 15]), Err(CryptoError::Padding));
        assert_eq!(decrypt_symmetric(&key, &[0; IV_SIZE], &[]), Err(CryptoError::Padding));
    }

    #[test]
    fn inconsistent_padding_bytes_are_rejected() {
        let key = [1u8; KEY_SIZE];
        let iv = [2u8; IV_SIZE];
        // Padding length 4 but one padding byte differs.
        let mut block = [0x55u8; BLOCK_SIZE];
        block[12..].copy_from_slice(&[4, 4, 3, 4]);
        let encryptor = Aes128CbcEnc::new_from_slices(&key, &iv).unwrap();
        let ciphertext = encryptor.encrypt_padded_vec_mut::<NoPadding>(&block);
        assert_eq!(decrypt_symmetric(&key, &iv, &ciphertext), Err(CryptoError::Padding));
    }

    #[test]
    fn negotiated_session_opens_and_verifies() {
        let (alice, bob, mut rng) = keys();
        let stats = RsaStats::default();

        let outbound = CipherSession::negotiate(&alice, bob.public_key(), &mut rng, &stats).unwrap();
        let envelope = outbound.seal(b"hello", [3; IV_SIZE], 3).unwrap();

        let inbound = CipherSession::open(&bob, &envelope, &stats).unwrap();
        assert_eq!(inbound.source(), alice.identity());
        assert!(!inbound.is_authenticated());
        assert!(inbound.verify(alice.public_key(), &stats));
        assert!(!inbound.verify(bob.public_key(), &stats));
        assert_eq!(inbound.unseal(&envelope).unwrap(), b"hello");

        let snapshot = stats.snapshot();
        assert_eq!((snapshot.sign, snapshot.encrypt, snapshot.decrypt, snapshot.verify), (1, 1, 1, 2));
    }

    #[test]
    fn session_for_someone_else_cannot_be_opened() {
        let (alice, bob, mut rng) = keys();
        let stats = RsaStats::default();
        let outbound = CipherSession::negotiate(&alice, bob.public_key(), &mut rng, &stats).unwrap();
        let envelope = outbound.seal(b"hello", [3; IV_SIZE], 3).unwrap();

        assert_eq!(CipherSession::open(&alice, &envelope, &stats).unwrap_err(), CryptoError::KeyDecryption);
    }

    #[test]
    fn swapped_metadata_iv_is_an_integrity_error() {
        let (alice, bob, mut rng) = keys();
        let stats = RsaStats::default();
        let outbound = CipherSession::negotiate(&alice, bob.public_key(), &mut rng, &stats).unwrap();
        let mut envelope = outbound.seal(b"hello", [3; IV_SIZE], 3).unwrap();
        envelope.metadata_iv[0] ^= 1;

        assert!(matches!(
            CipherSession::open(&bob, &envelope, &stats),
            Err(CryptoError::Integrity(_))
        ));
    }
}
