//! Flushes queued log chunks into batches on a size-or-time trigger
//!, publishing
//! each batch to the job's `Topic<LogChunk>` for live subscribers and
//! handing it to the persistence writer for durability.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;

use crate::pubsub::Topic;

use super::queue::JobLogQueue;

pub struct BatcherConfig {
    pub max_chunks: usize,
    pub flush_interval: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        BatcherConfig {
            max_chunks: 100,
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// Runs until `queue`'s `Arc` has no other owners besides this task and
/// itself, draining and publishing every flush tick. Intended to be
/// spawned as a `tokio::task` per active job.
pub async fn run(queue: Arc<JobLogQueue>, topic: Arc<Topic<crate::model::LogChunk>>, config: BatcherConfig, mut persist_tx: tokio::sync::mpsc::UnboundedSender<Vec<crate::model::LogChunk>>) {
    let mut ticker = interval(config.flush_interval);
    loop {
        ticker.tick().await;
        if Arc::strong_count(&queue) <= 1 {
            flush_once(&queue, &topic, config.max_chunks, &mut persist_tx);
            break;
        }
        flush_once(&queue, &topic, config.max_chunks, &mut persist_tx);
    }
}

fn flush_once(
    queue: &JobLogQueue,
    topic: &Topic<crate::model::LogChunk>,
    max_chunks: usize,
    persist_tx: &mut tokio::sync::mpsc::UnboundedSender<Vec<crate::model::LogChunk>>,
) {
    let batch = queue.drain_up_to(max_chunks);
    if batch.is_empty() {
        return;
    }
    for chunk in &batch {
        topic.publish(chunk.clone());
    }
    let _ = persist_tx.send(batch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logpipeline::overflow::OverflowStrategy;
    use crate::model::{LogChunk, LogStream};
    use uuid::Uuid;

    #[test]
    fn flush_once_publishes_and_forwards_nonempty_batch() {
        let queue = JobLogQueue::new(10, 1_000_000, OverflowStrategy::Alert);
        queue
            .push(LogChunk {
                job_id: Uuid::nil(),
                stream: LogStream::Stdout,
                sequence: 0,
                wall_ns: 0,
                bytes: b"hi".to_vec(),
            })
            .unwrap();

        let topic: Topic<LogChunk> = Topic::new(10);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut tx = tx;
        flush_once(&queue, &topic, 100, &mut tx);

        assert_eq!(topic.subscriber_count(), 0);
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn flush_once_is_noop_on_empty_queue() {
        let queue = JobLogQueue::new(10, 1_000_000, OverflowStrategy::Alert);
        let topic: Topic<LogChunk> = Topic::new(10);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut tx = tx;
        flush_once(&queue, &topic, 100, &mut tx);
        assert!(rx.try_recv().is_err());
    }
}
