//! Queue diagnostics.

use serde::Serialize;

use crate::header::Header;

/// Point-in-time view of a queue, for profile dumps and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// `"memory"` or `"file"`
    pub kind: &'static str,
    /// Backing file, if any
    pub path: Option<String>,
    /// Records queued or leased
    pub records: usize,
    /// Payload bytes queued and not leased
    pub available_bytes: u64,
    /// Payload bytes in the lease transaction
    pub leased_bytes: u64,
    /// Capacity in payload bytes
    pub max_size: u64,
    /// File header, for file queues
    pub header: Option<Header>,
    /// True once closed
    pub closed: bool,
}
