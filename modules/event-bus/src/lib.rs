//! In-process multi-topic event dispatcher.
//!
//! Publishing is non-blocking and best-effort: a subscriber whose queue is
//! full misses the event, and the drop is counted and logged. Subscribers
//! are isolated from each other; events published on one topic from one
//! task arrive in publish order at every subscriber of that topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

const DEFAULT_QUEUE_SIZE: usize = 1024;

struct SubscriberEntry<M> {
    id: u64,
    sender: mpsc::Sender<Arc<M>>,
    dropped: Arc<AtomicU64>,
}

/// A process-wide topic dispatcher, generic over the event type
pub struct EventBus<M> {
    topics: Mutex<HashMap<String, Vec<SubscriberEntry<M>>>>,
    next_id: AtomicU64,
    queue_size: usize,
}

impl<M> Default for EventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> {
    pub fn new() -> Self {
        Self::with_queue_size(DEFAULT_QUEUE_SIZE)
    }

    pub fn with_queue_size(queue_size: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            queue_size,
        }
    }

    /// Fan an event out to every current subscriber of `topic`. Never
    /// blocks; subscribers with a full queue miss the event.
    pub fn publish(&self, topic: &str, event: Arc<M>) {
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        let Some(subscribers) = topics.get_mut(topic) else {
            return;
        };
        subscribers.retain(|subscriber| match subscriber.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = subscriber.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    topic,
                    subscriber = subscriber.id,
                    total_dropped = total,
                    "subscriber queue full, dropping event"
                );
                true
            }
            // Receiver has gone away; prune the entry
            Err(TrySendError::Closed(_)) => false,
        });
        if subscribers.is_empty() {
            topics.remove(topic);
        }
    }

    /// Register a new subscriber for `topic`
    pub fn subscribe(&self, topic: &str) -> Subscription<M> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.queue_size);
        let dropped = Arc::new(AtomicU64::new(0));
        let entry = SubscriberEntry {
            id,
            sender,
            dropped: dropped.clone(),
        };
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        topics.entry(topic.to_string()).or_default().push(entry);
        Subscription {
            topic: topic.to_string(),
            id,
            receiver,
            dropped,
        }
    }

    /// Remove a subscriber; calling this for an already-removed handle is a
    /// no-op
    pub fn unsubscribe(&self, subscription: &Subscription<M>) {
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        if let Some(subscribers) = topics.get_mut(&subscription.topic) {
            subscribers.retain(|entry| entry.id != subscription.id);
            if subscribers.is_empty() {
                topics.remove(&subscription.topic);
            }
        }
    }

    /// Number of live subscribers on a topic, for admin introspection
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().expect("event bus lock poisoned");
        topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

/// A lazy stream of events, finite once unsubscribed
pub struct Subscription<M> {
    topic: String,
    id: u64,
    receiver: mpsc::Receiver<Arc<M>>,
    dropped: Arc<AtomicU64>,
}

impl<M> Subscription<M> {
    /// Await the next event. Returns `None` once unsubscribed and the queue
    /// has drained.
    pub async fn read(&mut self) -> Option<Arc<M>> {
        self.receiver.recv().await
    }

    /// Non-blocking read of an already-queued event
    pub fn try_read(&mut self) -> Option<Arc<M>> {
        self.receiver.try_recv().ok()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// How many events this subscriber has missed due to queue overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_deliver_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("chain");
        for n in 0..10u64 {
            bus.publish("chain", Arc::new(n));
        }
        for n in 0..10u64 {
            assert_eq!(*sub.read().await.unwrap(), n);
        }
    }

    #[tokio::test]
    async fn should_fan_out_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("chain");
        let mut b = bus.subscribe("chain");
        bus.publish("chain", Arc::new(7u64));
        assert_eq!(*a.read().await.unwrap(), 7);
        assert_eq!(*b.read().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn should_not_cross_topics() {
        let bus = EventBus::new();
        let mut chain = bus.subscribe("chain");
        let mut mempool = bus.subscribe("mempool");
        bus.publish("chain", Arc::new(1u64));
        assert_eq!(*chain.read().await.unwrap(), 1);
        assert!(mempool.try_read().is_none());
    }

    #[tokio::test]
    async fn should_drop_events_for_a_full_subscriber_without_blocking() {
        let bus = EventBus::with_queue_size(2);
        let mut slow = bus.subscribe("chain");
        for n in 0..5u64 {
            bus.publish("chain", Arc::new(n));
        }
        // The slow subscriber only sees the first two events
        assert_eq!(*slow.read().await.unwrap(), 0);
        assert_eq!(*slow.read().await.unwrap(), 1);
        assert!(slow.try_read().is_none());
        assert_eq!(slow.dropped(), 3);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let sub = bus.subscribe("chain");
        assert_eq!(bus.subscriber_count("chain"), 1);
        bus.unsubscribe(&sub);
        bus.unsubscribe(&sub);
        assert_eq!(bus.subscriber_count("chain"), 0);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe("chain");
        drop(sub);
        bus.publish("chain", Arc::new(1u64));
        assert_eq!(bus.subscriber_count("chain"), 0);
    }
}
