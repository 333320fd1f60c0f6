//! In-memory queue.
//!
//! Used when no disk buffer is configured, when the buffer file cannot be
//! created, and for the urgent lane. Contents are lost on restart.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;

use crate::{
    DurableQueue, MAX_RECORD_SIZE, QueueError, QueueStats,
    filter::{LeaseFilter, PassThrough},
};

struct Inner {
    records: VecDeque<Bytes>,
    /// Records before this index are leased
    leased_records: usize,
    leased_bytes: u64,
    total_bytes: u64,
    closed: bool,
}

/// Bounded in-memory [`DurableQueue`].
pub struct MemoryQueue {
    name: &'static str,
    max_size: u64,
    filter: Arc<dyn LeaseFilter>,
    inner: Mutex<Inner>,
    space: Condvar,
}

impl MemoryQueue {
    /// Queue holding up to `max_size` payload bytes.
    pub fn new(max_size: u64) -> Self {
        Self::with_filter("memory", max_size, Arc::new(PassThrough))
    }

    /// Queue whose leases pass through `filter`. `name` appears in stats.
    pub fn with_filter(name: &'static str, max_size: u64, filter: Arc<dyn LeaseFilter>) -> Self {
        Self {
            name,
            max_size,
            filter,
            inner: Mutex::new(Inner {
                records: VecDeque::new(),
                leased_records: 0,
                leased_bytes: 0,
                total_bytes: 0,
                closed: false,
            }),
            space: Condvar::new(),
        }
    }

    /// Append `record` only if it fits right now.
    ///
    /// Returns `Ok(false)` instead of waiting when the queue is over capacity.
    pub fn try_enqueue(&self, record: &[u8]) -> Result<bool, QueueError> {
        let len = check_record(record)?;
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if inner.total_bytes > 0 && inner.total_bytes + len > self.max_size {
            return Ok(false);
        }
        self.push(&mut inner, record);
        Ok(true)
    }

    fn push(&self, inner: &mut Inner, record: &[u8]) {
        inner.records.push_back(Bytes::copy_from_slice(record));
        inner.total_bytes += record.len() as u64;
        tracing::trace!(queue = self.name, len = record.len(), total = inner.total_bytes, "enqueued");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_record(record: &[u8]) -> Result<u64, QueueError> {
    let len = record.len() as u64;
    if len == 0 {
        return Err(QueueError::EmptyRecord);
    }
    if len > MAX_RECORD_SIZE {
        return Err(QueueError::RecordTooLarge { size: len, max: MAX_RECORD_SIZE });
    }
    Ok(len)
}

impl DurableQueue for MemoryQueue {
    fn enqueue(&self, record: &[u8]) -> Result<(), QueueError> {
        let len = check_record(record)?;

        let mut inner = self.lock();
        while !inner.closed && inner.total_bytes > 0 && inner.total_bytes + len > self.max_size {
            inner = self.space.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
        if inner.closed {
            return Err(QueueError::Closed);
        }

        self.push(&mut inner, record);
        Ok(())
    }

    fn lease(&self, max_bytes: u64) -> Result<Vec<u8>, QueueError> {
        let mut inner = self.lock();
        let mut leased = Vec::new();
        let mut taken = 0usize;

        while inner.leased_records < inner.records.len() {
            let record = inner.records[inner.leased_records].clone();
            leased.extend_from_slice(&self.filter.filter(&record));

            inner.leased_records += 1;
            inner.leased_bytes += record.len() as u64;
            taken += 1;
            if leased.len() as u64 >= max_bytes {
                break;
            }
        }

        if taken > 0 {
            tracing::trace!(
                queue = self.name,
                records = taken,
                len = leased.len(),
                leased_bytes = inner.leased_bytes,
                "leased"
            );
        }
        Ok(leased)
    }

    fn commit(&self) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let leased = inner.leased_records;
        inner.records.drain(..leased);
        inner.total_bytes -= inner.leased_bytes;
        inner.leased_bytes = 0;
        inner.leased_records = 0;
        drop(inner);

        self.space.notify_all();
        Ok(())
    }

    fn rollback(&self) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.leased_bytes > 0 {
            tracing::debug!(queue = self.name, bytes = inner.leased_bytes, "rolled back lease");
        }
        inner.leased_bytes = 0;
        inner.leased_records = 0;
        Ok(())
    }

    fn available_bytes(&self) -> u64 {
        let inner = self.lock();
        inner.total_bytes - inner.leased_bytes
    }

    fn leased_bytes(&self) -> u64 {
        self.lock().leased_bytes
    }

    fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            kind: self.name,
            path: None,
            records: inner.records.len(),
            available_bytes: inner.total_bytes - inner.leased_bytes,
            leased_bytes: inner.leased_bytes,
            max_size: self.max_size,
            header: None,
            closed: inner.closed,
        }
    }

    fn reset(&self) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.records.clear();
        inner.leased_records = 0;
        inner.leased_bytes = 0;
        inner.total_bytes = 0;
        drop(inner);

        self.space.notify_all();
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.records.clear();
        inner.leased_records = 0;
        inner.leased_bytes = 0;
        inner.total_bytes = 0;
        drop(inner);

        self.space.notify_all();
    }
}
