//! Gathering an upload batch from a queue.

use bytes::Bytes;
use fleetlink_proto::Compression;

use crate::{DurableQueue, QueueError};

/// Lease up to `budget` bytes as separately compressed chunks.
///
/// Leases in quarter steps of the budget, compressing each lease on its own,
/// until the compressed total reaches the budget or the queue runs dry. Small
/// chunks keep the receiver's decompression memory bounded while still
/// filling the upload.
///
/// Everything leased stays in the queue's lease transaction; the caller
/// commits after the upload succeeds or rolls back after it fails. If
/// compression fails the queue is reset: the data it was fed is no longer
/// trustworthy.
pub fn lease_and_compress(
    queue: &dyn DurableQueue,
    budget: u64,
    compression: Compression,
) -> Result<Vec<Bytes>, QueueError> {
    let step = (budget / 4).max(1);
    let mut chunks = Vec::new();
    let mut total = 0u64;

    while total < budget {
        let leased = queue.lease(step)?;
        if leased.is_empty() {
            break;
        }

        match compression.compress(&leased) {
            Ok(chunk) if !chunk.is_empty() => {
                total += chunk.len() as u64;
                chunks.push(Bytes::from(chunk));
            },
            Ok(_) | Err(_) => {
                tracing::error!(len = leased.len(), "failed to compress leased records, resetting queue");
                queue.reset()?;
                return Ok(Vec::new());
            },
        }
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryQueue;

    #[test]
    fn leases_in_quarter_steps() {
        let queue = MemoryQueue::new(1 << 20);
        for _ in 0..8 {
            queue.enqueue(&[7u8; 100]).unwrap();
        }

        let chunks = lease_and_compress(&queue, 400, Compression::None).unwrap();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() == 100));
        assert_eq!(queue.leased_bytes(), 400);
        assert_eq!(queue.available_bytes(), 400);
    }

    #[test]
    fn compressed_chunks_round_trip() {
        let queue = MemoryQueue::new(1 << 20);
        queue.enqueue(b"some highly compressible text text text text").unwrap();

        let chunks = lease_and_compress(&queue, 1024, Compression::Zlib).unwrap();
        assert_eq!(chunks.len(), 1);
        let back = Compression::Zlib.decompress(&chunks[0], 1024).unwrap();
        assert_eq!(back, b"some highly compressible text text text text");
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let queue = MemoryQueue::new(1024);
        assert!(lease_and_compress(&queue, 1024, Compression::Zlib).unwrap().is_empty());
    }
}
