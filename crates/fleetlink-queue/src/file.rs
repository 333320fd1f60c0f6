//! File-backed queue.
//!
//! One file: a fixed header followed by length-prefixed records (see
//! [`crate::header`]). The header is rewritten after every mutation, so a
//! crash at any point leaves a file that reopens into a valid queue:
//!
//! - records leased but never committed are replayed (at-least-once)
//! - a half-written append beyond the write pointer is discarded
//! - anything unreadable resets the queue to empty, with a logged notice
//!
//! The file shrinks back to the bare header whenever everything has been
//! committed. While a backlog persists, the committed prefix is reclaimed by
//! moving the live records to the front once the prefix exceeds the capacity
//! and no longer overlaps them.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use crate::{
    DurableQueue, MAX_RECORD_SIZE, QueueError, QueueStats,
    ephemeral::create_ephemeral_file,
    filter::{LeaseFilter, PassThrough},
    header::{FIRST_RECORD_OFFSET, Header, RECORD_PREFIX},
};

/// Copy granularity for compaction.
const COPY_CHUNK: usize = 1024 * 1024;

struct Inner {
    file: File,
    header: Header,
    /// Offset the next lease reads from
    lease_pointer: u64,
    /// Live records, leased or not
    records: usize,
    leased_records: usize,
    closed: bool,
}

impl Inner {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let raw = self.header.encode();
        self.write_at(0, &raw)
    }

    fn read_prefix(&mut self, offset: u64) -> io::Result<u64> {
        let mut raw = [0u8; RECORD_PREFIX as usize];
        self.read_at(offset, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Return the file to a bare header. Never fails: an I/O error here
    /// leaves in-memory state empty and is retried by the next header write.
    fn truncate(&mut self) {
        if let Err(e) = self.file.set_len(FIRST_RECORD_OFFSET) {
            tracing::warn!(error = %e, "failed to truncate queue file");
        }
        self.header = Header::empty(self.header.max_size);
        self.lease_pointer = FIRST_RECORD_OFFSET;
        self.records = 0;
        self.leased_records = 0;
        if let Err(e) = self.write_header() {
            tracing::warn!(error = %e, "failed to rewrite queue header");
        }
    }

    fn total_bytes(&self) -> u64 {
        self.header.available_bytes + self.header.leased_bytes
    }

    /// Move live records over a committed prefix that no longer overlaps them.
    fn compact(&mut self) -> io::Result<()> {
        let dead = self.header.read_pointer - FIRST_RECORD_OFFSET;
        let live = self.header.write_pointer - self.header.read_pointer;
        if dead <= self.header.max_size || dead < live {
            return Ok(());
        }

        let mut buf = vec![0u8; COPY_CHUNK.min(live as usize)];
        let mut copied = 0u64;
        while copied < live {
            let n = (live - copied).min(buf.len() as u64) as usize;
            self.read_at(self.header.read_pointer + copied, &mut buf[..n])?;
            self.write_at(FIRST_RECORD_OFFSET + copied, &buf[..n])?;
            copied += n as u64;
        }

        tracing::debug!(reclaimed = dead, live, "compacted queue file");
        self.header.read_pointer = FIRST_RECORD_OFFSET;
        self.header.write_pointer = FIRST_RECORD_OFFSET + live;
        self.lease_pointer = FIRST_RECORD_OFFSET;
        self.write_header()?;
        self.file.set_len(self.header.write_pointer)
    }
}

/// Crash-safe [`DurableQueue`] stored in a single file.
pub struct FileQueue {
    path: PathBuf,
    filter: Arc<dyn LeaseFilter>,
    inner: Mutex<Inner>,
    space: Condvar,
}

impl FileQueue {
    /// Open or create a persistent queue at `path` holding up to `max_size`
    /// payload bytes. Existing contents are recovered.
    pub fn open(path: impl AsRef<Path>, max_size: u64) -> Result<Self, QueueError> {
        Self::open_with_filter(path, max_size, Arc::new(PassThrough))
    }

    /// [`FileQueue::open`] with leases passing through `filter`.
    pub fn open_with_filter(
        path: impl AsRef<Path>,
        max_size: u64,
        filter: Arc<dyn LeaseFilter>,
    ) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?;
        Self::recover(path, file, max_size, filter)
    }

    /// Create a fresh queue whose file is removed when the queue is dropped.
    pub fn create_ephemeral(
        path: impl AsRef<Path>,
        max_size: u64,
        filter: Arc<dyn LeaseFilter>,
    ) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        let file = create_ephemeral_file(&path)?;
        Self::recover(path, file, max_size, filter)
    }

    fn recover(
        path: PathBuf,
        file: File,
        max_size: u64,
        filter: Arc<dyn LeaseFilter>,
    ) -> Result<Self, QueueError> {
        let mut inner = Inner {
            file,
            header: Header::empty(max_size),
            lease_pointer: FIRST_RECORD_OFFSET,
            records: 0,
            leased_records: 0,
            closed: false,
        };

        let file_len = inner.file.metadata()?.len();
        if file_len == 0 {
            inner.write_header()?;
        } else if let Err(reason) = Self::load(&mut inner, file_len, max_size) {
            tracing::warn!(path = %path.display(), %reason, "possible corruption detected, resetting queue");
            inner.truncate();
        }

        tracing::info!(
            path = %path.display(),
            max_size,
            available = inner.header.available_bytes,
            records = inner.records,
            "opened file queue"
        );
        Ok(Self { path, filter, inner: Mutex::new(inner), space: Condvar::new() })
    }

    /// Validate an existing file and adopt its contents.
    ///
    /// Walks every live record, so anything a later lease would trip over is
    /// caught here instead.
    fn load(inner: &mut Inner, file_len: u64, max_size: u64) -> Result<(), String> {
        let mut raw = vec![0u8; file_len.min(FIRST_RECORD_OFFSET) as usize];
        inner.read_at(0, &mut raw).map_err(|e| e.to_string())?;
        let mut header = Header::decode(&raw, file_len).map_err(|e| e.to_string())?;

        let mut offset = header.read_pointer;
        let mut payload = 0u64;
        let mut records = 0usize;
        while offset < header.write_pointer {
            if offset + RECORD_PREFIX > header.write_pointer {
                return Err(format!("truncated length prefix at offset {offset}"));
            }
            let len = inner.read_prefix(offset).map_err(|e| e.to_string())?;
            if len == 0 || len > MAX_RECORD_SIZE {
                return Err(format!("implausible record length {len} at offset {offset}"));
            }
            let end = offset + RECORD_PREFIX + len;
            if end > header.write_pointer {
                return Err(format!(
                    "record of length {len} at offset {offset} runs past write pointer {}",
                    header.write_pointer
                ));
            }
            payload += len;
            records += 1;
            offset = end;
        }

        if header.leased_bytes != 0 {
            tracing::info!(bytes = header.leased_bytes, "replaying uncommitted lease");
        }
        if file_len > header.write_pointer {
            tracing::warn!(
                bytes = file_len - header.write_pointer,
                "discarding unfinished tail of queue file"
            );
            inner.file.set_len(header.write_pointer).map_err(|e| e.to_string())?;
        }

        header.available_bytes = payload;
        header.leased_bytes = 0;
        header.max_size = max_size;
        inner.lease_pointer = header.read_pointer;
        inner.records = records;
        inner.header = header;
        inner.write_header().map_err(|e| e.to_string())
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset after an I/O failure and hand the error back.
    fn fail(&self, inner: &mut Inner, error: io::Error) -> QueueError {
        tracing::error!(path = %self.path.display(), %error, "queue I/O failed, resetting");
        inner.truncate();
        self.space.notify_all();
        QueueError::Io(error)
    }

    /// Reset on unreadable records found while leasing.
    fn corrupted(&self, inner: &mut Inner, reason: &str) {
        tracing::error!(path = %self.path.display(), reason, "possible corruption detected, resetting queue");
        inner.truncate();
        self.space.notify_all();
    }
}

impl DurableQueue for FileQueue {
    fn enqueue(&self, record: &[u8]) -> Result<(), QueueError> {
        let len = record.len() as u64;
        if len == 0 {
            return Err(QueueError::EmptyRecord);
        }
        if len > MAX_RECORD_SIZE {
            return Err(QueueError::RecordTooLarge { size: len, max: MAX_RECORD_SIZE });
        }

        let mut inner = self.lock();
        while !inner.closed
            && inner.total_bytes() > 0
            && inner.total_bytes() + len > inner.header.max_size
        {
            inner = self.space.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
        if inner.closed {
            return Err(QueueError::Closed);
        }

        let mut framed = Vec::with_capacity(RECORD_PREFIX as usize + record.len());
        framed.extend_from_slice(&len.to_le_bytes());
        framed.extend_from_slice(record);

        let at = inner.header.write_pointer;
        if let Err(e) = inner.write_at(at, &framed) {
            return Err(self.fail(&mut inner, e));
        }
        inner.header.write_pointer += framed.len() as u64;
        inner.header.available_bytes += len;
        inner.records += 1;
        if let Err(e) = inner.write_header() {
            return Err(self.fail(&mut inner, e));
        }

        tracing::trace!(len, write_pointer = inner.header.write_pointer, "enqueued");
        Ok(())
    }

    fn lease(&self, max_bytes: u64) -> Result<Vec<u8>, QueueError> {
        let mut inner = self.lock();
        let mut leased = Vec::new();

        while inner.lease_pointer < inner.header.write_pointer {
            let offset = inner.lease_pointer;
            let Ok(len) = inner.read_prefix(offset) else {
                self.corrupted(&mut inner, "file too short");
                return Ok(Vec::new());
            };
            if len == 0 || len > MAX_RECORD_SIZE {
                self.corrupted(&mut inner, "record length is too large");
                return Ok(Vec::new());
            }
            if offset + RECORD_PREFIX + len > inner.header.write_pointer {
                self.corrupted(&mut inner, "record runs past write pointer");
                return Ok(Vec::new());
            }

            let mut record = vec![0u8; len as usize];
            if inner.read_at(offset + RECORD_PREFIX, &mut record).is_err() {
                self.corrupted(&mut inner, "record shorter than its length");
                return Ok(Vec::new());
            }
            leased.extend_from_slice(&self.filter.filter(&record));

            inner.lease_pointer = offset + RECORD_PREFIX + len;
            inner.header.leased_bytes += len;
            inner.header.available_bytes -= len;
            inner.leased_records += 1;
            if leased.len() as u64 >= max_bytes {
                break;
            }
        }

        if inner.leased_records > 0 {
            if let Err(e) = inner.write_header() {
                return Err(self.fail(&mut inner, e));
            }
        }
        Ok(leased)
    }

    fn commit(&self) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.leased_records == 0 {
            return Ok(());
        }

        if inner.lease_pointer == inner.header.write_pointer {
            inner.truncate();
        } else {
            inner.header.read_pointer = inner.lease_pointer;
            inner.header.leased_bytes = 0;
            inner.records -= inner.leased_records;
            inner.leased_records = 0;
            let persisted = inner.write_header().and_then(|()| inner.compact());
            if let Err(e) = persisted {
                return Err(self.fail(&mut inner, e));
            }
        }
        tracing::trace!(read_pointer = inner.header.read_pointer, "committed");
        drop(inner);

        self.space.notify_all();
        Ok(())
    }

    fn rollback(&self) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.leased_records == 0 {
            return Ok(());
        }

        tracing::debug!(bytes = inner.header.leased_bytes, "rolled back lease");
        inner.lease_pointer = inner.header.read_pointer;
        inner.header.available_bytes += inner.header.leased_bytes;
        inner.header.leased_bytes = 0;
        inner.leased_records = 0;
        if let Err(e) = inner.write_header() {
            return Err(self.fail(&mut inner, e));
        }
        Ok(())
    }

    fn available_bytes(&self) -> u64 {
        self.lock().header.available_bytes
    }

    fn leased_bytes(&self) -> u64 {
        self.lock().header.leased_bytes
    }

    fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            kind: "file",
            path: Some(self.path.display().to_string()),
            records: inner.records,
            available_bytes: inner.header.available_bytes,
            leased_bytes: inner.header.leased_bytes,
            max_size: inner.header.max_size,
            header: Some(inner.header),
            closed: inner.closed,
        }
    }

    fn reset(&self) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.truncate();
        drop(inner);

        tracing::info!(path = %self.path.display(), "queue reset");
        self.space.notify_all();
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        if let Err(e) = inner.file.sync_data() {
            tracing::warn!(error = %e, "failed to sync queue file on close");
        }
        drop(inner);

        self.space.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn new_file_holds_only_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let queue = FileQueue::open(&path, 1024).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), FIRST_RECORD_OFFSET);
        assert_eq!(queue.total_bytes(), 0);
    }

    #[test]
    fn full_commit_truncates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let queue = FileQueue::open(&path, 1024).unwrap();

        queue.enqueue(b"hello").unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), FIRST_RECORD_OFFSET + 8 + 5);
        assert_eq!(queue.lease(1024).unwrap(), b"hello");
        queue.commit().unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), FIRST_RECORD_OFFSET);
        assert_eq!(queue.stats().header.unwrap(), Header::empty(1024));
    }

    #[test]
    fn partial_commit_advances_read_pointer() {
        let dir = tempdir().unwrap();
        let queue = FileQueue::open(dir.path().join("queue.bin"), 1024).unwrap();

        queue.enqueue(b"first").unwrap();
        queue.enqueue(b"second").unwrap();
        assert_eq!(queue.lease(1).unwrap(), b"first");
        queue.commit().unwrap();

        let header = queue.stats().header.unwrap();
        assert_eq!(header.read_pointer, FIRST_RECORD_OFFSET + 8 + 5);
        assert_eq!(header.available_bytes, 6);
        assert_eq!(queue.lease(1024).unwrap(), b"second");
    }

    #[test]
    fn committed_prefix_is_compacted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let queue = FileQueue::open(&path, 16).unwrap();

        // Keep a one-record backlog so the file never fully drains.
        queue.enqueue(b"0123456789").unwrap();
        for _ in 0..3 {
            queue.enqueue(b"abcdef").unwrap();
            queue.lease(1).unwrap();
            queue.commit().unwrap();
        }

        let header = queue.stats().header.unwrap();
        assert!(header.read_pointer - FIRST_RECORD_OFFSET <= 16 + 14);
        assert_eq!(fs::metadata(&path).unwrap().len(), header.write_pointer);
        assert_eq!(queue.lease(1024).unwrap(), b"abcdef");
    }

    #[test]
    fn unfinished_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        {
            let queue = FileQueue::open(&path, 1024).unwrap();
            queue.enqueue(b"kept").unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 0, 0, 0, 0, 0, 0, 0, b'x']).unwrap();
        drop(file);

        let queue = FileQueue::open(&path, 1024).unwrap();
        assert_eq!(queue.available_bytes(), 4);
        assert_eq!(fs::metadata(&path).unwrap().len(), FIRST_RECORD_OFFSET + 8 + 4);
        assert_eq!(queue.lease(1024).unwrap(), b"kept");
    }

    #[test]
    fn ephemeral_queue_works_without_a_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let queue = FileQueue::create_ephemeral(&path, 1024, Arc::new(PassThrough)).unwrap();

        queue.enqueue(b"data").unwrap();
        assert_eq!(queue.lease(1024).unwrap(), b"data");
        #[cfg(unix)]
        assert!(!path.exists());
    }

    #[test]
    fn reset_empties_queue() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let queue = FileQueue::open(&path, 1024).unwrap();
        queue.enqueue(b"a").unwrap();
        queue.enqueue(b"b").unwrap();
        queue.lease(1).unwrap();

        queue.reset().unwrap();
        assert_eq!(queue.total_bytes(), 0);
        assert!(queue.lease(1024).unwrap().is_empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), FIRST_RECORD_OFFSET);
    }
}
