//! A single generic pub/sub primitive, reused by the Async Log Pipeline
//! (per-job log chunk fan-out) and the State Store (per-job change
//! notifications).
//!
//! Rather than maintain two parallel fan-out mechanisms — an ad-hoc
//! per-job buffer manager and a generic topic-based system — this keeps
//! exactly one: a retained-snapshot topic that replays buffered history to
//! a new subscriber before switching it to the live feed, so "subscribe"
//! always means "catch-up plus live", whether the payload is a log chunk
//! or a job-status change event.

use std::collections::VecDeque;

use parking_lot::RwLock;

/// A topic retaining up to `capacity` recent items and fanning new items
/// out to live subscribers. `T` must be cheap to clone (log chunks and
/// state-change events both are: small structs, `Vec<u8>`/`String`
/// payloads that are already owned per-message).
pub struct Topic<T: Clone + Send + 'static> {
    capacity: usize,
    inner: RwLock<TopicInner<T>>,
}

struct TopicInner<T> {
    history: VecDeque<T>,
    subscribers: Vec<crossbeam_channel::Sender<T>>,
}

/// Per-subscriber bounded mailbox size.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 10;

impl<T: Clone + Send + 'static> Topic<T> {
    pub fn new(capacity: usize) -> Self {
        Topic {
            capacity,
            inner: RwLock::new(TopicInner {
                history: VecDeque::with_capacity(capacity.min(1024)),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Publish one item: append to history (evicting the oldest if full)
    /// and push to every live subscriber. A full subscriber buffer drops
    /// the new item for that subscriber only — callers should
    /// check `publish`'s return value if they want to count drops.
    pub fn publish(&self, item: T) -> usize {
        let mut inner = self.inner.write();
        if inner.history.len() >= self.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(item.clone());

        let mut dropped = 0;
        for tx in &inner.subscribers {
            if tx.try_send(item.clone()).is_err() {
                dropped += 1;
            }
        }
        dropped
    }

    /// Subscribe: returns the retained history snapshot plus a receiver for
    /// subsequent live items.
    pub fn subscribe(&self, buffer: usize) -> (Vec<T>, crossbeam_channel::Receiver<T>) {
        let mut inner = self.inner.write();
        let (tx, rx) = crossbeam_channel::bounded(buffer.max(1));
        inner.subscribers.push(tx);
        (inner.history.iter().cloned().collect(), rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.read().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_sees_history_then_live_items() {
        let topic: Topic<i32> = Topic::new(10);
        topic.publish(1);
        topic.publish(2);

        let (history, rx) = topic.subscribe(DEFAULT_SUBSCRIBER_BUFFER);
        assert_eq!(history, vec![1, 2]);

        topic.publish(3);
        assert_eq!(rx.try_recv().unwrap(), 3);
    }

    #[test]
    fn history_capacity_evicts_oldest() {
        let topic: Topic<i32> = Topic::new(2);
        topic.publish(1);
        topic.publish(2);
        topic.publish(3);
        let (history, _rx) = topic.subscribe(DEFAULT_SUBSCRIBER_BUFFER);
        assert_eq!(history, vec![2, 3]);
    }

    #[test]
    fn full_subscriber_buffer_drops_for_that_subscriber_only() {
        let topic: Topic<i32> = Topic::new(100);
        let (_h1, rx1) = topic.subscribe(1);
        let (_h2, rx2) = topic.subscribe(2);

        topic.publish(1);
        let dropped = topic.publish(2);
        // rx1 has capacity 1 and already holds item 1, so item 2 is dropped for it.
        assert_eq!(dropped, 1);
        assert_eq!(rx1.try_recv().unwrap(), 1);
        assert_eq!(rx2.try_recv().unwrap(), 1);
        assert_eq!(rx2.try_recv().unwrap(), 2);
    }
}
