//! Event bus abstraction and the in-process bus.

use crate::{Result, RouterError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, watch};

/// Capacity of each topic's broadcast channel.
const TOPIC_CAPACITY: usize = 1024;

/// Topic-based publish/subscribe transport for encoded events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an encoded event to every subscriber of `topic`.
    async fn publish(&self, topic: &str, event: Bytes) -> Result<()>;

    /// Subscribes to `topic`.
    fn subscribe(&self, topic: &str) -> Result<EventSubscription>;

    /// Returns true if the bus accepts publishes.
    fn is_ready(&self) -> bool;

    /// Watches readiness. The value changes whenever the bus connects or
    /// disconnects.
    fn readiness(&self) -> watch::Receiver<bool>;
}

/// A stream of encoded events from one topic.
#[derive(Debug)]
pub struct EventSubscription {
    topic: String,
    receiver: broadcast::Receiver<Bytes>,
}

impl EventSubscription {
    /// Wraps a broadcast receiver.
    pub fn new(topic: impl Into<String>, receiver: broadcast::Receiver<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            receiver,
        }
    }

    /// Returns the topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next event. Returns `None` once the topic is closed.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = %self.topic, skipped, "subscriber lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next event if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = %self.topic, skipped, "subscriber lagged, events skipped");
                }
                Err(_) => return None,
            }
        }
    }
}

/// An in-process bus built on broadcast channels.
///
/// Every subscriber sees every event published to its topic, including its
/// own.
#[derive(Debug)]
pub struct MemoryEventBus {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    ready: watch::Sender<bool>,
    published: AtomicU64,
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventBus {
    /// Creates a ready bus with no topics.
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            ready: watch::Sender::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// Marks the bus connected or disconnected.
    pub fn set_ready(&self, ready: bool) {
        let was = self.ready.send_replace(ready);
        if was != ready {
            tracing::debug!(ready, "bus readiness changed");
        }
    }

    /// Returns the number of events published.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Closes a topic. Its subscriptions end once drained.
    pub fn close(&self, topic: &str) {
        self.topics.remove(topic);
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, topic: &str, event: Bytes) -> Result<()> {
        if !self.is_ready() {
            return Err(RouterError::NotReady);
        }
        // No subscribers is not an error.
        let _ = self.sender(topic).send(event);
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<EventSubscription> {
        Ok(EventSubscription::new(topic, self.sender(topic).subscribe()))
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    fn readiness(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = MemoryEventBus::new();
        let mut a = bus.subscribe("cohortA").unwrap();
        let mut b = bus.subscribe("cohortA").unwrap();
        let mut other = bus.subscribe("cohortB").unwrap();

        bus.publish("cohortA", Bytes::from_static(b"one")).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert!(other.receiver.try_recv().is_err());
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn test_not_ready_rejects_publish() {
        let bus = MemoryEventBus::new();
        bus.set_ready(false);
        let err = bus
            .publish("cohortA", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::NotReady));
    }

    #[tokio::test]
    async fn test_readiness_reports_changes() {
        let bus = MemoryEventBus::new();
        let mut ready = bus.readiness();
        assert!(*ready.borrow_and_update());

        bus.set_ready(false);
        ready.changed().await.unwrap();
        assert!(!*ready.borrow_and_update());

        bus.set_ready(true);
        ready.changed().await.unwrap();
        assert!(*ready.borrow_and_update());
        assert!(bus.is_ready());
    }

    #[tokio::test]
    async fn test_closed_topic_ends_subscription() {
        let bus = MemoryEventBus::new();
        let mut sub = bus.subscribe("cohortA").unwrap();
        bus.close("cohortA");
        assert!(sub.recv().await.is_none());
        assert_eq!(sub.topic(), "cohortA");
    }
}
