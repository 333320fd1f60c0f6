//! Fuzz target for opening a corrupted queue file
//!
//! A crash or a bad disk can leave anything in the buffer file. Opening it
//! must either recover the readable prefix of records or start over.
//!
//! # Invariants
//!
//! - FileQueue::open NEVER panics on arbitrary file contents
//! - A successfully opened queue leases and commits without error
//! - Claimed record lengths beyond the file are not trusted

#![no_main]

use fleetlink_queue::{DurableQueue, FileQueue};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("queue.fq");
    std::fs::write(&path, data).expect("write seed file");

    if let Ok(queue) = FileQueue::open(&path, 1 << 20) {
        let total = queue.total_bytes();
        let mut drained = 0u64;
        while queue.available_bytes() > 0 {
            let before = queue.leased_bytes();
            queue.lease(1).expect("lease from opened queue");
            drained += queue.leased_bytes() - before;
            queue.commit().expect("commit");
        }
        assert_eq!(drained, total);
        queue.enqueue(b"after recovery").expect("enqueue after recovery");
    }
});
