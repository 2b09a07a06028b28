//! The bounded per-job producer queue: a job's supervisor
//! pushes `LogChunk`s as they're read off stdout/stderr; once the queue
//! reaches its configured capacity or soft byte cap, new pushes trigger
//! the configured overflow strategy instead of blocking the producer
//! (blocking here would mean blocking the job's own I/O).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::errors::Result;
use crate::model::LogChunk;

use super::overflow::{self, OverflowOutcome, OverflowStrategy};

pub struct JobLogQueue {
    capacity: usize,
    soft_byte_cap: u64,
    overflow_strategy: OverflowStrategy,
    inner: Mutex<VecDeque<LogChunk>>,
    bytes_queued: AtomicU64,
    next_sequence: AtomicU64,
    pub dropped_chunks: AtomicU64,
}

impl JobLogQueue {
    pub fn new(capacity: usize, soft_byte_cap: u64, overflow_strategy: OverflowStrategy) -> Self {
        JobLogQueue {
            capacity,
            soft_byte_cap,
            overflow_strategy,
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            bytes_queued: AtomicU64::new(0),
            next_sequence: AtomicU64::new(0),
            dropped_chunks: AtomicU64::new(0),
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Push one chunk. Returns `Some(outcome)` if pushing this chunk
    /// triggered an overflow strategy application on the existing backlog.
    pub fn push(&self, chunk: LogChunk) -> Result<Option<OverflowOutcome>> {
        let mut queue = self.inner.lock();
        let over_count = queue.len() >= self.capacity;
        let over_bytes = self.bytes_queued.load(Ordering::SeqCst) + chunk.bytes.len() as u64 > self.soft_byte_cap;

        if over_count || over_bytes {
            let backlog: Vec<LogChunk> = queue.drain(..).collect();
            self.bytes_queued.store(0, Ordering::SeqCst);
            let outcome = overflow::apply(self.overflow_strategy, &backlog, 4)?;
            match &outcome {
                OverflowOutcome::Sampled(sampled) => {
                    for c in sampled {
                        self.bytes_queued.fetch_add(c.bytes.len() as u64, Ordering::SeqCst);
                        queue.push_back(c.clone());
                    }
                }
                OverflowOutcome::Alerted(n) => {
                    self.dropped_chunks.fetch_add(*n as u64, Ordering::SeqCst);
                }
                OverflowOutcome::Compressed(_) | OverflowOutcome::Spilled(_) => {
                    // Backlog moved out of the live queue entirely; the
                    // caller is responsible for durably recording it.
                }
            }
            self.bytes_queued.fetch_add(chunk.bytes.len() as u64, Ordering::SeqCst);
            queue.push_back(chunk);
            return Ok(Some(outcome));
        }

        self.bytes_queued.fetch_add(chunk.bytes.len() as u64, Ordering::SeqCst);
        queue.push_back(chunk);
        Ok(None)
    }

    /// Drain up to `max` chunks for batching.
    pub fn drain_up_to(&self, max: usize) -> Vec<LogChunk> {
        let mut queue = self.inner.lock();
        let n = max.min(queue.len());
        let drained: Vec<LogChunk> = queue.drain(..n).collect();
        let drained_bytes: u64 = drained.iter().map(|c| c.bytes.len() as u64).sum();
        self.bytes_queued.fetch_sub(drained_bytes.min(self.bytes_queued.load(Ordering::SeqCst)), Ordering::SeqCst);
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogStream;
    use uuid::Uuid;

    fn chunk(seq: u64, size: usize) -> LogChunk {
        LogChunk {
            job_id: Uuid::nil(),
            stream: LogStream::Stdout,
            sequence: seq,
            wall_ns: 0,
            bytes: vec![0u8; size],
        }
    }

    #[test]
    fn push_under_capacity_does_not_overflow() {
        let q = JobLogQueue::new(10, 1_000_000, OverflowStrategy::Alert);
        for i in 0..5 {
            assert!(q.push(chunk(i, 10)).unwrap().is_none());
        }
        assert_eq!(q.len(), 5);
    }

    #[test]
    fn exceeding_capacity_triggers_alert_strategy() {
        let q = JobLogQueue::new(2, 1_000_000, OverflowStrategy::Alert);
        q.push(chunk(0, 10)).unwrap();
        q.push(chunk(1, 10)).unwrap();
        let outcome = q.push(chunk(2, 10)).unwrap();
        assert!(outcome.is_some());
        assert_eq!(q.dropped_chunks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drain_up_to_respects_max_and_shrinks_queue() {
        let q = JobLogQueue::new(100, 1_000_000, OverflowStrategy::Alert);
        for i in 0..20 {
            q.push(chunk(i, 10)).unwrap();
        }
        let drained = q.drain_up_to(5);
        assert_eq!(drained.len(), 5);
        assert_eq!(q.len(), 15);
    }
}
