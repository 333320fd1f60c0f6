//! Error types for wire format encoding and decoding.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding fleetlink wire formats.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input ended before a complete structure could be read
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to continue decoding
        needed: usize,
        /// Bytes actually remaining
        available: usize,
    },

    /// Envelope magic did not match
    #[error("invalid magic: {0:02x?}")]
    InvalidMagic([u8; 4]),

    /// A length-prefixed field exceeds its limit
    #[error("field {field} too large: {size} bytes (max {max})")]
    FieldTooLarge {
        /// Name of the offending field
        field: &'static str,
        /// Declared size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Bytes left over after a complete structure was decoded
    #[error("{0} trailing bytes after structure")]
    TrailingBytes(usize),

    /// Compression tag is not one we know
    #[error("unknown compression tag: {0}")]
    UnknownCompression(u8),

    /// A string field was not valid UTF-8
    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// zlib compression or decompression failed
    #[error("compression error: {0}")]
    Compression(String),

    /// CBOR serialization failed
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}
