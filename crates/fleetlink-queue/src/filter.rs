//! Hook applied to records as they are leased.

use std::borrow::Cow;

/// Rewrites records on their way out of the queue.
///
/// Used to strip messages belonging to cancelled sessions so a cancelled job
/// stops retransmitting its backlog. The output must still be a well-formed
/// record stream (possibly empty); the queue consumes the full original
/// record regardless of what the filter returns.
pub trait LeaseFilter: Send + Sync {
    /// Filtered form of `record`.
    fn filter<'a>(&self, record: &'a [u8]) -> Cow<'a, [u8]>;
}

/// Filter that leaves every record untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl LeaseFilter for PassThrough {
    fn filter<'a>(&self, record: &'a [u8]) -> Cow<'a, [u8]> {
        Cow::Borrowed(record)
    }
}
