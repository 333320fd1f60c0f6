//! Fleetlink wire formats.
//!
//! Three layers live here, from the outside in:
//!
//! - [`Envelope`]: the encrypted, HMAC-protected frame exchanged between an
//!   endpoint and the server. Pure structure; cryptography happens in
//!   `fleetlink-crypto`.
//! - [`PackedMessageList`]: the plaintext carried inside an envelope. A list of
//!   (optionally zlib-compressed) chunks plus a nonce and timestamp.
//! - [`Message`] records: length-prefixed CBOR message lists. Chunks are plain
//!   concatenations of records, so a durable queue can hand out any prefix of
//!   its records and the receiver can still split them apart.
//!
//! # Invariants
//!
//! Decoders never trust length fields: every length is checked against the
//! remaining input and a per-field maximum before anything is allocated.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod codec;
pub mod compression;
pub mod envelope;
pub mod errors;
pub mod message;
pub mod packed;

pub use compression::Compression;
pub use envelope::{Envelope, HMAC_SIZE, IV_SIZE, PROTOCOL_VERSION};
pub use errors::{ProtocolError, Result};
pub use message::{Message, MessageKind, MessageList, MessagePayload, decode_records};
pub use packed::PackedMessageList;
