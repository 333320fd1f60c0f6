//! Encrypted envelope exchanged over the network.
//!
//! An `Envelope` is the only object that crosses the wire. One envelope is
//! carried per HTTP POST body or per WebSocket message.
//!
//! Layout (all integers Big Endian):
//!
//! ```text
//! magic "FLE1"                      4 bytes
//! encrypted_cipher      u32 len  || bytes   (RSA-OAEP key blob)
//! encrypted_metadata    u32 len  || bytes   (AES-128-CBC)
//! metadata_iv                       16 bytes
//! encrypted_payload     u32 len  || bytes   (AES-128-CBC, PKCS#7)
//! packet_iv                         16 bytes
//! protocol_version                  u32
//! full_hmac                         20 bytes (HMAC-SHA1)
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    codec::{ensure_empty, get_blob, get_u32, put_blob, take_array},
    errors::{ProtocolError, Result},
};

/// Protocol version stamped into every envelope.
pub const PROTOCOL_VERSION: u32 = 3;

/// AES block and IV size.
pub const IV_SIZE: usize = 16;

/// HMAC-SHA1 tag size.
pub const HMAC_SIZE: usize = 20;

/// Encrypted, integrity-protected wire message.
///
/// # Invariants
///
/// - An envelope with an empty `encrypted_cipher` carries nothing. Receivers
///   treat it as a no-op rather than an error.
/// - `full_hmac` covers every field except `metadata_iv` and the magic. The
///   metadata IV is additionally bound to the RSA-protected key blob, so a
///   modified copy is detected after the key blob is recovered.
///
/// # Security
///
/// Decoding establishes structure only. Nothing here proves the envelope was
/// produced by the claimed peer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    /// Session key blob, RSA-OAEP encrypted to the recipient
    pub encrypted_cipher: Bytes,
    /// Session metadata (source identity and signature), AES encrypted
    pub encrypted_metadata: Bytes,
    /// IV used for `encrypted_metadata`
    pub metadata_iv: [u8; IV_SIZE],
    /// Packed message list, AES encrypted
    pub encrypted_payload: Bytes,
    /// Fresh per-packet IV used for `encrypted_payload`
    pub packet_iv: [u8; IV_SIZE],
    /// Sender's protocol version
    pub protocol_version: u32,
    /// HMAC-SHA1 over [`Envelope::authenticated_bytes`]
    pub full_hmac: [u8; HMAC_SIZE],
}

impl Envelope {
    /// Magic prefix identifying an envelope
    pub const MAGIC: [u8; 4] = *b"FLE1";

    /// Largest key blob or metadata blob accepted (64 KiB)
    pub const MAX_HEADER_FIELD: usize = 64 * 1024;

    /// Largest encrypted payload accepted (64 MiB)
    pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

    /// True if the envelope carries a session key blob.
    pub fn has_cipher(&self) -> bool {
        !self.encrypted_cipher.is_empty()
    }

    /// Bytes covered by `full_hmac`.
    ///
    /// `encrypted_payload || encrypted_cipher || encrypted_metadata ||
    /// packet_iv || protocol_version (u32 LE)`
    pub fn authenticated_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.encrypted_payload.len()
                + self.encrypted_cipher.len()
                + self.encrypted_metadata.len()
                + IV_SIZE
                + 4,
        );
        out.extend_from_slice(&self.encrypted_payload);
        out.extend_from_slice(&self.encrypted_cipher);
        out.extend_from_slice(&self.encrypted_metadata);
        out.extend_from_slice(&self.packet_iv);
        out.extend_from_slice(&self.protocol_version.to_le_bytes());
        out
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        4 + 4
            + self.encrypted_cipher.len()
            + 4
            + self.encrypted_metadata.len()
            + IV_SIZE
            + 4
            + self.encrypted_payload.len()
            + IV_SIZE
            + 4
            + HMAC_SIZE
    }

    /// Encode into `dst`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FieldTooLarge` if any blob exceeds its limit
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        dst.put_slice(&Self::MAGIC);
        put_blob(dst, "encrypted_cipher", &self.encrypted_cipher, Self::MAX_HEADER_FIELD)?;
        put_blob(dst, "encrypted_metadata", &self.encrypted_metadata, Self::MAX_HEADER_FIELD)?;
        dst.put_slice(&self.metadata_iv);
        put_blob(dst, "encrypted_payload", &self.encrypted_payload, Self::MAX_PAYLOAD)?;
        dst.put_slice(&self.packet_iv);
        dst.put_u32(self.protocol_version);
        dst.put_slice(&self.full_hmac);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode an envelope occupying exactly `bytes`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidMagic` if the prefix is wrong
    /// - `ProtocolError::Truncated` if any field runs past the input
    /// - `ProtocolError::FieldTooLarge` if a length prefix exceeds its limit
    /// - `ProtocolError::TrailingBytes` if input remains after the HMAC
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut src = bytes;

        let magic: [u8; 4] = take_array(&mut src)?;
        if magic != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let encrypted_cipher =
            Bytes::copy_from_slice(get_blob(&mut src, "encrypted_cipher", Self::MAX_HEADER_FIELD)?);
        let encrypted_metadata = Bytes::copy_from_slice(get_blob(
            &mut src,
            "encrypted_metadata",
            Self::MAX_HEADER_FIELD,
        )?);
        let metadata_iv = take_array(&mut src)?;
        let encrypted_payload =
            Bytes::copy_from_slice(get_blob(&mut src, "encrypted_payload", Self::MAX_PAYLOAD)?);
        let packet_iv = take_array(&mut src)?;
        let protocol_version = get_u32(&mut src)?;
        let full_hmac = take_array(&mut src)?;
        ensure_empty(src)?;

        Ok(Self {
            encrypted_cipher,
            encrypted_metadata,
            metadata_iv,
            encrypted_payload,
            packet_iv,
            protocol_version,
            full_hmac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            encrypted_cipher: Bytes::from_static(&[1; 128]),
            encrypted_metadata: Bytes::from_static(&[2; 48]),
            metadata_iv: [3; IV_SIZE],
            encrypted_payload: Bytes::from_static(&[4; 64]),
            packet_iv: [5; IV_SIZE],
            protocol_version: PROTOCOL_VERSION,
            full_hmac: [6; HMAC_SIZE],
        }
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let envelope = sample();
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(bytes.len(), envelope.encoded_len());
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().to_bytes().unwrap().to_vec();
        bytes[0] = b'X';
        assert!(matches!(Envelope::decode(&bytes), Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn rejects_truncation_at_every_length() {
        let bytes = sample().to_bytes().unwrap();
        for len in 0..bytes.len() {
            assert!(Envelope::decode(&bytes[..len]).is_err(), "prefix of {len} bytes decoded");
        }
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = sample().to_bytes().unwrap().to_vec();
        bytes.push(0);
        assert_eq!(Envelope::decode(&bytes), Err(ProtocolError::TrailingBytes(1)));
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut bytes = sample().to_bytes().unwrap().to_vec();
        bytes[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ProtocolError::FieldTooLarge { field: "encrypted_cipher", .. })
        ));
    }

    #[test]
    fn empty_envelope_has_no_cipher() {
        let envelope = Envelope::default();
        assert!(!envelope.has_cipher());
        let decoded = Envelope::decode(&envelope.to_bytes().unwrap()).unwrap();
        assert!(!decoded.has_cipher());
    }

    #[test]
    fn authenticated_bytes_order() {
        let envelope = sample();
        let covered = envelope.authenticated_bytes();
        assert_eq!(&covered[..64], &[4; 64]);
        assert_eq!(&covered[64..192], &[1; 128]);
        assert_eq!(&covered[192..240], &[2; 48]);
        assert_eq!(&covered[240..256], &[5; 16]);
        assert_eq!(&covered[256..], &PROTOCOL_VERSION.to_le_bytes());
    }
}
