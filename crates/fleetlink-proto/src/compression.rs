//! Chunk compression.

use std::io::{Read, Write};

use flate2::{Compression as Level, read::ZlibDecoder, write::ZlibEncoder};

use crate::errors::{ProtocolError, Result};

/// Compression applied to every chunk of a [`crate::PackedMessageList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    /// Chunks are raw record streams
    None = 0,
    /// Chunks are zlib streams
    #[default]
    Zlib = 1,
}

impl Compression {
    /// Wire tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Zlib),
            other => Err(ProtocolError::UnknownCompression(other)),
        }
    }

    /// Compress `data`.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Level::default());
                encoder.write_all(data).map_err(|e| ProtocolError::Compression(e.to_string()))?;
                encoder.finish().map_err(|e| ProtocolError::Compression(e.to_string()))
            },
        }
    }

    /// Decompress `data`, refusing to inflate beyond `limit` bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FieldTooLarge` if the output would exceed `limit`
    /// - `ProtocolError::Compression` if the zlib stream is malformed
    pub fn decompress(self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        match self {
            Self::None => {
                if data.len() > limit {
                    return Err(ProtocolError::FieldTooLarge {
                        field: "chunk",
                        size: data.len(),
                        max: limit,
                    });
                }
                Ok(data.to_vec())
            },
            Self::Zlib => {
                let mut out = Vec::new();
                let decoder = ZlibDecoder::new(data);
                decoder
                    .take(limit as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| ProtocolError::Compression(e.to_string()))?;
                if out.len() > limit {
                    return Err(ProtocolError::FieldTooLarge {
                        field: "chunk",
                        size: out.len(),
                        max: limit,
                    });
                }
                Ok(out)
            },
        }
    }
}
