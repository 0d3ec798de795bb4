//! Keyed fan-out of server messages to live WebSocket connections
//!
//! Each subscription owns the receiving half of an unbounded channel and
//! removes itself from the map when dropped, so a closed socket can never
//! leave a stale sender behind.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

struct Subscriber<T> {
    id: u64,
    sender: mpsc::UnboundedSender<T>,
}

struct Inner<K: Eq + Hash, T> {
    subscribers: DashMap<K, Vec<Subscriber<T>>>,
    next_id: AtomicU64,
}

/// Map of key -> active subscribers (multiple connections per key).
pub struct SubscriberMap<K: Eq + Hash, T> {
    inner: Arc<Inner<K, T>>,
}

impl<K, T> SubscriberMap<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a new subscriber for `key`.
    pub fn subscribe(&self, key: K) -> Subscription<K, T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .subscribers
            .entry(key.clone())
            .or_insert_with(Vec::new)
            .push(Subscriber { id, sender });

        Subscription {
            key,
            id,
            receiver,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Send to every live subscriber of `key`; returns how many accepted it.
    pub fn publish(&self, key: &K, message: T) -> usize {
        let Some(subscribers) = self.inner.subscribers.get(key) else {
            return 0;
        };

        let mut delivered = 0;
        for subscriber in subscribers.iter() {
            if subscriber.sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::warn!("Subscriber {} for {:?} is closed", subscriber.id, key);
            }
        }
        delivered
    }

    /// Number of keys with at least one subscriber.
    pub fn key_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

impl<K, T> Default for SubscriberMap<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a subscription. Unsubscribes on drop.
pub struct Subscription<K: Eq + Hash, T> {
    key: K,
    id: u64,
    receiver: mpsc::UnboundedReceiver<T>,
    inner: Arc<Inner<K, T>>,
}

impl<K: Eq + Hash, T> Subscription<K, T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

impl<K: Eq + Hash, T> Drop for Subscription<K, T> {
    fn drop(&mut self) {
        let now_empty = match self.inner.subscribers.get_mut(&self.key) {
            Some(mut subscribers) => {
                subscribers.retain(|s| s.id != self.id);
                subscribers.is_empty()
            }
            None => false,
        };

        // If no more subscribers for this key, remove the entry
        if now_empty {
            self.inner
                .subscribers
                .remove_if(&self.key, |_, subscribers| subscribers.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let map: SubscriberMap<String, u32> = SubscriberMap::new();
        let mut first = map.subscribe("user1".to_string());
        let mut second = map.subscribe("user1".to_string());

        assert_eq!(map.publish(&"user1".to_string(), 7), 2);
        assert_eq!(first.recv().await, Some(7));
        assert_eq!(second.recv().await, Some(7));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let map: SubscriberMap<String, u32> = SubscriberMap::new();
        let first = map.subscribe("user1".to_string());
        let second = map.subscribe("user1".to_string());
        assert_eq!(map.key_count(), 1);

        drop(first);
        assert_eq!(map.key_count(), 1);
        assert_eq!(map.publish(&"user1".to_string(), 1), 1);

        drop(second);
        assert_eq!(map.key_count(), 0);
        assert_eq!(map.publish(&"user1".to_string(), 1), 0);
    }
}
