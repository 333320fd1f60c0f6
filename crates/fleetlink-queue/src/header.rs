//! On-disk header of a file queue.
//!
//! # Wire Format
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ magic "FLQUEUE1"            (8 bytes)    │  offset 0
//! │ read_pointer     u64 LE     (8 bytes)    │  offset 8
//! │ write_pointer    u64 LE     (8 bytes)    │  offset 16
//! │ leased_bytes     u64 LE     (8 bytes)    │  offset 24
//! │ max_size         u64 LE     (8 bytes)    │  offset 32
//! │ available_bytes  u64 LE     (8 bytes)    │  offset 40
//! │ reserved, zero              (16 bytes)   │  offset 48
//! ├──────────────────────────────────────────┤
//! │ record: length u64 LE | payload          │  offset 64
//! │ record: length u64 LE | payload          │
//! │ ...                                      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Records between `read_pointer` and `write_pointer` are live. Anything
//! before `read_pointer` has been committed; anything after `write_pointer`
//! is an unfinished append.

use thiserror::Error;

/// Offset of the first record. The header is padded to here.
pub const FIRST_RECORD_OFFSET: u64 = 64;

/// Size of a record's length prefix.
pub const RECORD_PREFIX: u64 = 8;

/// Why a header could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Fewer bytes than a full header
    #[error("file too short: {0} bytes")]
    TooShort(usize),

    /// Magic does not match
    #[error("invalid magic")]
    InvalidMagic,

    /// Pointers are out of order or outside the file
    #[error("inconsistent pointers: read {read}, write {write}, file {file_len}")]
    InconsistentPointers {
        /// Read pointer
        read: u64,
        /// Write pointer
        write: u64,
        /// File length
        file_len: u64,
    },
}

/// Queue file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Header {
    /// Offset of the oldest uncommitted record
    pub read_pointer: u64,
    /// Offset the next record is appended at
    pub write_pointer: u64,
    /// Payload bytes in the lease transaction at the last header write
    pub leased_bytes: u64,
    /// Capacity in payload bytes
    pub max_size: u64,
    /// Payload bytes queued and not leased
    pub available_bytes: u64,
}

impl Header {
    /// Queue file magic.
    pub const MAGIC: [u8; 8] = *b"FLQUEUE1";

    /// Header of an empty queue.
    pub fn empty(max_size: u64) -> Self {
        Self {
            read_pointer: FIRST_RECORD_OFFSET,
            write_pointer: FIRST_RECORD_OFFSET,
            leased_bytes: 0,
            max_size,
            available_bytes: 0,
        }
    }

    /// True if no records are live.
    pub fn is_empty(&self) -> bool {
        self.read_pointer == self.write_pointer
    }

    /// Serialize into the fixed-size header block.
    pub fn encode(&self) -> [u8; FIRST_RECORD_OFFSET as usize] {
        let mut out = [0u8; FIRST_RECORD_OFFSET as usize];
        out[0..8].copy_from_slice(&Self::MAGIC);
        out[8..16].copy_from_slice(&self.read_pointer.to_le_bytes());
        out[16..24].copy_from_slice(&self.write_pointer.to_le_bytes());
        out[24..32].copy_from_slice(&self.leased_bytes.to_le_bytes());
        out[32..40].copy_from_slice(&self.max_size.to_le_bytes());
        out[40..48].copy_from_slice(&self.available_bytes.to_le_bytes());
        out
    }

    /// Parse a header, checking the pointers against the file length.
    pub fn decode(bytes: &[u8], file_len: u64) -> Result<Self, HeaderError> {
        if bytes.len() < FIRST_RECORD_OFFSET as usize {
            return Err(HeaderError::TooShort(bytes.len()));
        }
        if bytes[0..8] != Self::MAGIC {
            return Err(HeaderError::InvalidMagic);
        }

        let field = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let header = Self {
            read_pointer: field(8),
            write_pointer: field(16),
            leased_bytes: field(24),
            max_size: field(32),
            available_bytes: field(40),
        };

        let ordered = FIRST_RECORD_OFFSET <= header.read_pointer
            && header.read_pointer <= header.write_pointer
            && header.write_pointer <= file_len;
        if !ordered {
            return Err(HeaderError::InconsistentPointers {
                read: header.read_pointer,
                write: header.write_pointer,
                file_len,
            });
        }
        Ok(header)
    }
}
