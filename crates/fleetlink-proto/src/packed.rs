//! Plaintext carried inside an envelope.

use bytes::{BufMut, Bytes};

use crate::{
    codec::{ensure_empty, get_blob, get_u8, get_u16, get_u32, get_u64, take},
    compression::Compression,
    errors::{ProtocolError, Result},
    message::{Message, MessageList, decode_records},
};

/// Batches of message records, each chunk compressed independently.
///
/// Layout (Big Endian):
///
/// ```text
/// compression u8 | timestamp_micros u64 | nonce u16 len || utf-8
/// | count u32 | (u32 len || chunk) * count
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackedMessageList {
    /// Compression applied to every chunk
    pub compression: Compression,
    /// Compressed record streams
    pub message_list: Vec<Bytes>,
    /// Deployment nonce; lets the server reject traffic meant for another
    /// deployment sharing the same keys
    pub nonce: String,
    /// Sender wall clock, microseconds since the Unix epoch
    pub timestamp: u64,
}

impl PackedMessageList {
    /// Maximum number of chunks in one list
    pub const MAX_CHUNKS: usize = 4096;

    /// Maximum size of one compressed chunk (64 MiB)
    pub const MAX_CHUNK: usize = 64 * 1024 * 1024;

    /// Maximum decompressed size of one chunk (256 MiB)
    pub const MAX_INFLATED_CHUNK: usize = 256 * 1024 * 1024;

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.message_list.len() > Self::MAX_CHUNKS {
            return Err(ProtocolError::FieldTooLarge {
                field: "message_list",
                size: self.message_list.len(),
                max: Self::MAX_CHUNKS,
            });
        }
        if self.nonce.len() > usize::from(u16::MAX) {
            return Err(ProtocolError::FieldTooLarge {
                field: "nonce",
                size: self.nonce.len(),
                max: usize::from(u16::MAX),
            });
        }

        let total: usize = self.message_list.iter().map(|c| 4 + c.len()).sum();
        let mut out = Vec::with_capacity(1 + 8 + 2 + self.nonce.len() + 4 + total);
        out.put_u8(self.compression.tag());
        out.put_u64(self.timestamp);
        out.put_u16(self.nonce.len() as u16);
        out.put_slice(self.nonce.as_bytes());
        out.put_u32(self.message_list.len() as u32);
        for chunk in &self.message_list {
            crate::codec::put_blob(&mut out, "chunk", chunk, Self::MAX_CHUNK)?;
        }
        Ok(out)
    }

    /// Decode a list occupying exactly `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut src = bytes;
        let compression = Compression::from_tag(get_u8(&mut src)?)?;
        let timestamp = get_u64(&mut src)?;
        let nonce_len = usize::from(get_u16(&mut src)?);
        let nonce = std::str::from_utf8(take(&mut src, nonce_len)?)
            .map_err(|_| ProtocolError::InvalidUtf8("nonce"))?
            .to_string();

        let count = get_u32(&mut src)? as usize;
        if count > Self::MAX_CHUNKS {
            return Err(ProtocolError::FieldTooLarge {
                field: "message_list",
                size: count,
                max: Self::MAX_CHUNKS,
            });
        }
        let mut message_list = Vec::with_capacity(count);
        for _ in 0..count {
            message_list.push(Bytes::copy_from_slice(get_blob(&mut src, "chunk", Self::MAX_CHUNK)?));
        }
        ensure_empty(src)?;

        Ok(Self { compression, message_list, nonce, timestamp })
    }

    /// Decompress every chunk and decode the records inside.
    pub fn messages(&self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for chunk in &self.message_list {
            let raw = self.compression.decompress(chunk, Self::MAX_INFLATED_CHUNK)?;
            messages.extend(decode_records(&raw)?);
        }
        Ok(messages)
    }

    /// Build a single-chunk list from message lists.
    pub fn from_lists(
        lists: &[MessageList],
        compression: Compression,
        nonce: &str,
        timestamp: u64,
    ) -> Result<Self> {
        let mut raw = Vec::new();
        for list in lists {
            raw.extend(list.encode_record()?);
        }
        Ok(Self {
            compression,
            message_list: vec![Bytes::from(compression.compress(&raw)?)],
            nonce: nonce.to_string(),
            timestamp,
        })
    }
}
