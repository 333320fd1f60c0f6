//! Queue error types.
//!
//! Corruption is deliberately absent: a damaged queue file is reset and
//! logged, never reported to the caller.

use std::io;

use thiserror::Error;

/// Errors returned by [`crate::DurableQueue`] operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Queue was closed
    #[error("queue is closed")]
    Closed,

    /// Zero-length records are indistinguishable from a damaged file
    #[error("empty record")]
    EmptyRecord,

    /// Record exceeds [`crate::MAX_RECORD_SIZE`]
    #[error("record of {size} bytes exceeds maximum {max}")]
    RecordTooLarge {
        /// Record size
        size: u64,
        /// Maximum accepted size
        max: u64,
    },

    /// Backing file I/O failed
    ///
    /// The queue resets itself to a valid empty state before returning this.
    #[error("queue I/O error: {0}")]
    Io(#[from] io::Error),
}

impl QueueError {
    /// Returns true if the queue can no longer accept records.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
