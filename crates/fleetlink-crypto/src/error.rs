//! Error types for the session protocol.

use thiserror::Error;

/// Errors raised while negotiating sessions or sealing and opening envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// HMAC mismatch, or the envelope disagrees with its own session key blob
    #[error("integrity check failed: {0}")]
    Integrity(&'static str),

    /// CBC ciphertext is not block aligned or its padding is invalid
    #[error("invalid padding")]
    Padding,

    /// Envelope structure could not be parsed
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// RSA-OAEP decryption of the session key blob failed
    #[error("session key blob could not be decrypted")]
    KeyDecryption,

    /// Decrypted session key blob or metadata is malformed
    #[error("invalid session cipher: {0}")]
    InvalidCipher(&'static str),

    /// Symmetric key has the wrong length
    #[error("incorrect key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// No public key is known for a destination
    #[error("no public key found for destination {0}")]
    NoPublicKey(String),

    /// Peer has not been authenticated
    #[error("source {0} is not trusted")]
    NotTrusted(String),

    /// A key was presented for an identity it does not derive to
    #[error("identity mismatch: claimed {claimed}, key derives {derived}")]
    IdentityMismatch {
        /// Identity the caller claimed
        claimed: String,
        /// Identity derived from the key
        derived: String,
    },

    /// Identity string cannot be used as a resolver key
    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),

    /// RSA modulus outside the supported range
    #[error("unsupported RSA key size: {bits} bits")]
    UnsupportedKeySize {
        /// Modulus size
        bits: usize,
    },

    /// PEM or DER encoding failure
    #[error("key encoding error: {0}")]
    KeyEncoding(String),

    /// RSA operation failure other than key blob decryption
    #[error("RSA error: {0}")]
    Rsa(String),

    /// Plaintext could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Resolver storage failure
    #[error("resolver storage error: {0}")]
    Storage(String),
}

impl CryptoError {
    /// Returns true if the envelope must be dropped.
    ///
    /// Fatal errors mean the envelope is corrupt, forged or not meant for us.
    /// Retrying cannot help and the process carries on with the next
    /// envelope.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Integrity(_)
                | Self::Padding
                | Self::MalformedEnvelope(_)
                | Self::KeyDecryption
                | Self::InvalidCipher(_)
                | Self::InvalidKeyLength { .. }
                | Self::UnsupportedKeySize { .. }
                | Self::Serialization(_)
        )
    }

    /// Returns true if the error concerns peer trust rather than the data.
    pub fn is_trust(&self) -> bool {
        matches!(self, Self::NoPublicKey(_) | Self::NotTrusted(_) | Self::IdentityMismatch { .. })
    }
}

impl From<fleetlink_proto::ProtocolError> for CryptoError {
    fn from(err: fleetlink_proto::ProtocolError) -> Self {
        Self::MalformedEnvelope(err.to_string())
    }
}
