//! Fuzz target for FileQueue operation sequences with restarts
//!
//! Drives a file queue and a plain in-memory model through the same
//! enqueue/lease/commit/rollback/reopen sequence.
//!
//! # Invariants
//!
//! - Leases return whole records in FIFO order
//! - Rollback puts leased records back at the head
//! - Reopen replays everything not committed, in order
//! - Byte accounting matches the model after every step

#![no_main]

use std::collections::VecDeque;

use arbitrary::Arbitrary;
use fleetlink_queue::{DurableQueue, FileQueue};
use libfuzzer_sys::fuzz_target;

const MAX_SIZE: u64 = 4096;

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Enqueue { len: u8, fill: u8 },
    Lease { max_bytes: u16 },
    Commit,
    Rollback,
    Reopen,
}

#[derive(Default)]
struct Model {
    queued: VecDeque<Vec<u8>>,
    leased: Vec<Vec<u8>>,
}

impl Model {
    fn total(&self) -> u64 {
        self.queued.iter().chain(&self.leased).map(|r| r.len() as u64).sum()
    }

    fn leased_bytes(&self) -> u64 {
        self.leased.iter().map(|r| r.len() as u64).sum()
    }

    fn lease(&mut self, max_bytes: u64) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(record) = self.queued.pop_front() {
            out.extend_from_slice(&record);
            self.leased.push(record);
            if out.len() as u64 >= max_bytes {
                break;
            }
        }
        out
    }

    fn rollback(&mut self) {
        for record in self.leased.drain(..).rev() {
            self.queued.push_front(record);
        }
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("queue.fq");
    let mut queue = FileQueue::open(&path, MAX_SIZE).expect("open fresh queue");
    let mut model = Model::default();

    for op in ops {
        match op {
            Op::Enqueue { len, fill } => {
                let record = vec![fill; usize::from(len) + 1];
                // Enqueue waits while full; only offer what fits.
                if model.total() > 0 && model.total() + record.len() as u64 > MAX_SIZE {
                    continue;
                }
                queue.enqueue(&record).expect("enqueue");
                model.queued.push_back(record);
            },
            Op::Lease { max_bytes } => {
                let got = queue.lease(u64::from(max_bytes)).expect("lease");
                assert_eq!(got, model.lease(u64::from(max_bytes)));
            },
            Op::Commit => {
                queue.commit().expect("commit");
                model.leased.clear();
            },
            Op::Rollback => {
                queue.rollback().expect("rollback");
                model.rollback();
            },
            Op::Reopen => {
                queue.close();
                drop(queue);
                queue = FileQueue::open(&path, MAX_SIZE).expect("reopen");
                model.rollback();
            },
        }

        assert_eq!(queue.leased_bytes(), model.leased_bytes());
        assert_eq!(queue.total_bytes(), model.total());
    }
});
