//! Async log pipeline: per-job bounded queues feeding a
//! batcher that publishes to subscribers and forwards to persistence.

pub mod batcher;
pub mod overflow;
pub mod queue;

pub use overflow::OverflowStrategy;
pub use queue::JobLogQueue;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::LogChunk;
use crate::pubsub::Topic;

/// Keeps one queue and one topic per active job, created on first chunk
/// and torn down when the job's supervisor drops its handle.
#[derive(Clone)]
pub struct LogPipeline {
    config: Arc<crate::config::LogPipelineConfig>,
    runtime: tokio::runtime::Handle,
    queues: Arc<RwLock<HashMap<Uuid, Arc<JobLogQueue>>>>,
    topics: Arc<RwLock<HashMap<Uuid, Arc<Topic<LogChunk>>>>>,
}

impl LogPipeline {
    /// `runtime` is the handle the batcher task (a `tokio::task`) is
    /// spawned onto; the caller owns the actual `tokio::runtime::Runtime`
    /// and must keep it alive for as long as jobs may still be producing
    /// log chunks.
    pub fn new(config: crate::config::LogPipelineConfig, runtime: tokio::runtime::Handle) -> Self {
        LogPipeline {
            config: Arc::new(config),
            runtime,
            queues: Arc::new(RwLock::new(HashMap::new())),
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn queue_for(&self, job_id: Uuid) -> Arc<JobLogQueue> {
        self.queues
            .write()
            .entry(job_id)
            .or_insert_with(|| {
                Arc::new(JobLogQueue::new(
                    self.config.queue_capacity,
                    self.config.soft_memory_cap_bytes,
                    self.config.overflow_strategy,
                ))
            })
            .clone()
    }

    pub fn topic_for(&self, job_id: Uuid) -> Arc<Topic<LogChunk>> {
        self.topics
            .write()
            .entry(job_id)
            .or_insert_with(|| Arc::new(Topic::new(self.config.queue_capacity.min(10_000))))
            .clone()
    }

    /// Spawn the batcher task for a job; call once per job lifetime.
    pub fn spawn_batcher(
        &self,
        job_id: Uuid,
        persist_tx: tokio::sync::mpsc::UnboundedSender<Vec<LogChunk>>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue_for(job_id);
        let topic = self.topic_for(job_id);
        let cfg = batcher::BatcherConfig {
            max_chunks: self.config.batch_max_chunks,
            flush_interval: std::time::Duration::from_millis(self.config.batch_flush_interval_ms),
        };
        self.runtime.spawn(batcher::run(queue, topic, cfg, persist_tx))
    }

    /// Subscribe to a job's live + historical log feed. Returns `None` if the job has
    /// never produced a chunk (no topic was ever created for it).
    pub fn subscribe(&self, job_id: Uuid) -> Option<(Vec<LogChunk>, crossbeam_channel::Receiver<LogChunk>)> {
        let topic = self.topics.read().get(&job_id)?.clone();
        Some(topic.subscribe(self.config.subscriber_buffer))
    }

    pub fn teardown(&self, job_id: Uuid) {
        self.queues.write().remove(&job_id);
        self.topics.write().remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pipeline() -> (LogPipeline, tokio::runtime::Runtime) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pipeline = LogPipeline::new(crate::config::LogPipelineConfig::default(), rt.handle().clone());
        (pipeline, rt)
    }

    #[test]
    fn queue_for_is_stable_across_calls() {
        let (pipeline, _rt) = test_pipeline();
        let id = Uuid::new_v4();
        let q1 = pipeline.queue_for(id);
        let q2 = pipeline.queue_for(id);
        assert!(Arc::ptr_eq(&q1, &q2));
    }

    #[test]
    fn subscribe_returns_none_for_untouched_job() {
        let (pipeline, _rt) = test_pipeline();
        assert!(pipeline.subscribe(Uuid::new_v4()).is_none());
    }

    #[test]
    fn teardown_removes_queue_and_topic() {
        let (pipeline, _rt) = test_pipeline();
        let id = Uuid::new_v4();
        pipeline.queue_for(id);
        pipeline.topic_for(id);
        pipeline.teardown(id);
        assert!(pipeline.subscribe(id).is_none());
    }
}
