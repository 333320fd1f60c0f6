//! Durable outbound queues for fleetlink endpoints.
//!
//! An endpoint produces results faster than it can always upload them, and it
//! may lose its network or crash at any time. Outbound records therefore go
//! through a [`DurableQueue`] with three-phase delivery:
//!
//! ```text
//! enqueue ──> queued ──lease──> leased ──commit──> gone
//!                ^                 │
//!                └────rollback─────┘
//! ```
//!
//! Two implementations:
//!
//! - [`MemoryQueue`]: bounded in-memory buffer, lost on restart
//! - [`FileQueue`]: single file with a small header, survives crashes; leases
//!   that were never committed are replayed on reopen (at-least-once)
//!
//! # Invariants
//!
//! - Records are leased in FIFO enqueue order. Rollback keeps rolled-back
//!   records at the head, ahead of anything enqueued since.
//! - `available_bytes + leased_bytes` never exceeds capacity, except for a
//!   single record larger than the whole capacity admitted into an empty
//!   queue.
//! - A producer over capacity waits; nothing is dropped to make room.

#![forbid(unsafe_code)]

mod ephemeral;
pub mod error;
pub mod file;
pub mod filter;
pub mod header;
pub mod lease;
pub mod memory;
pub mod stats;

pub use ephemeral::create_ephemeral_file;
pub use error::QueueError;
pub use file::FileQueue;
pub use filter::{LeaseFilter, PassThrough};
pub use header::{FIRST_RECORD_OFFSET, Header};
pub use lease::lease_and_compress;
pub use memory::MemoryQueue;
pub use stats::QueueStats;

/// Largest record a queue accepts, and the largest length prefix a file queue
/// trusts when reading back.
pub const MAX_RECORD_SIZE: u64 = 64 * 1024 * 1024;

/// Three-phase delivery queue.
///
/// Implementations are shared between a producer and a consumer task, so all
/// methods take `&self`. `enqueue` is the only method that blocks; everything
/// else returns promptly.
///
/// Only one lease transaction exists at a time. Repeated `lease` calls extend
/// it; `commit` or `rollback` ends it.
pub trait DurableQueue: Send + Sync {
    /// Append `record`, waiting while the queue is over capacity.
    ///
    /// A record is admitted once it fits, or immediately if the queue is
    /// empty, so an oversized record cannot wedge the producer forever.
    ///
    /// # Errors
    ///
    /// - `QueueError::Closed` if the queue is closed before or during the wait
    /// - `QueueError::EmptyRecord` / `QueueError::RecordTooLarge` for records
    ///   the queue could not read back
    fn enqueue(&self, record: &[u8]) -> Result<(), QueueError>;

    /// Lease the oldest queued records, concatenated.
    ///
    /// Takes whole records until at least `max_bytes` are gathered, so the
    /// last record may overshoot. Always takes at least one record if any is
    /// queued. Records pass through the queue's [`LeaseFilter`]; the full
    /// unfiltered record is consumed even if the filter shrinks it, so the
    /// result can be empty while bytes are leased.
    fn lease(&self, max_bytes: u64) -> Result<Vec<u8>, QueueError>;

    /// Drop every leased record permanently and wake waiting producers.
    fn commit(&self) -> Result<(), QueueError>;

    /// Return every leased record to the head of the queue.
    fn rollback(&self) -> Result<(), QueueError>;

    /// Bytes queued and not leased.
    fn available_bytes(&self) -> u64;

    /// Bytes in the current lease transaction.
    fn leased_bytes(&self) -> u64;

    /// Queued plus leased bytes.
    fn total_bytes(&self) -> u64 {
        self.available_bytes() + self.leased_bytes()
    }

    /// Diagnostic snapshot.
    fn stats(&self) -> QueueStats;

    /// Drop everything, leased or not, and wake waiting producers.
    fn reset(&self) -> Result<(), QueueError>;

    /// Refuse further records and release any waiting producer.
    ///
    /// A file queue keeps its file so unsent records survive a restart.
    fn close(&self);
}
