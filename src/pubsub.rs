//! The in-process bus coupling writes to live subscribers.
//!
//! Three subscription scopes exist: a single stream, a category, and a
//! whole namespace. Each subscription owns a bounded channel; `publish`
//! fans an event out to every matching subscriber with a non-blocking send
//! and drops the event for any subscriber whose channel is full. Live tail
//! prefers liveness over completeness; a lagging subscriber recovers by
//! re-reading the log from its last position.
//!
//! Delivery order to any single subscriber equals the order of `publish`
//! calls. Across subscribers no global order is promised.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tracing::trace;

/// Capacity of each subscriber's channel.
pub const SUBSCRIBER_CAPACITY: usize = 100;

/// A minimal write notification: enough for a subscriber to decide whether
/// to re-read the log, without carrying the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteEvent {
    /// Namespace the write happened in.
    pub namespace: String,
    /// Stream written to.
    pub stream: String,
    /// Category of that stream.
    pub category: String,
    /// Stream position assigned to the message.
    pub position: i64,
    /// Global position assigned to the message.
    pub global_position: i64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
enum SubKey {
    Stream(String, String),
    Category(String, String),
    Namespace(String),
}

#[derive(Default)]
struct Tables {
    closed: bool,
    next_id: u64,
    subscribers: HashMap<SubKey, HashMap<u64, mpsc::Sender<WriteEvent>>>,
}

#[derive(Default)]
struct Inner {
    tables: RwLock<Tables>,
}

impl Inner {
    // The lock is never held across an await, so a poisoned guard can only
    // mean a panic mid-mutation of a HashMap; recovering the guard is safe.
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The bus. Cheap to clone; all clones share the subscriber tables.
#[derive(Clone, Default)]
pub struct PubSub {
    inner: Arc<Inner>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to writes on one stream.
    pub fn subscribe_stream(&self, namespace: &str, stream: &str) -> Subscription {
        self.subscribe(SubKey::Stream(namespace.to_string(), stream.to_string()))
    }

    /// Subscribes to writes on every stream of a category.
    pub fn subscribe_category(&self, namespace: &str, category: &str) -> Subscription {
        self.subscribe(SubKey::Category(
            namespace.to_string(),
            category.to_string(),
        ))
    }

    /// Subscribes to every write in a namespace.
    pub fn subscribe_namespace(&self, namespace: &str) -> Subscription {
        self.subscribe(SubKey::Namespace(namespace.to_string()))
    }

    fn subscribe(&self, key: SubKey) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut tables = self.inner.write();
        let id = tables.next_id;
        tables.next_id += 1;
        if !tables.closed {
            tables.subscribers.entry(key.clone()).or_default().insert(id, tx);
        }
        // After close the sender is dropped right here, so the subscription
        // observes an already-closed channel.

        Subscription {
            key,
            id,
            inner: self.inner.clone(),
            rx,
        }
    }

    /// Delivers an event to every matching subscriber. Never blocks: a full
    /// subscriber channel drops the event for that subscriber only.
    pub fn publish(&self, event: &WriteEvent) {
        let keys = [
            SubKey::Stream(event.namespace.clone(), event.stream.clone()),
            SubKey::Category(event.namespace.clone(), event.category.clone()),
            SubKey::Namespace(event.namespace.clone()),
        ];

        let tables = self.inner.read();
        for key in &keys {
            if let Some(subscribers) = tables.subscribers.get(key) {
                for tx in subscribers.values() {
                    if tx.try_send(event.clone()).is_err() {
                        trace!(
                            stream = %event.stream,
                            global_position = event.global_position,
                            "subscriber channel full, dropping event"
                        );
                    }
                }
            }
        }
    }

    /// Shuts the bus down: every subscriber channel closes, waking waiting
    /// receivers. Subsequent subscriptions observe a closed channel.
    pub fn close(&self) {
        let mut tables = self.inner.write();
        tables.closed = true;
        tables.subscribers.clear();
    }

    /// Number of live subscriptions, across all scopes.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .read()
            .subscribers
            .values()
            .map(HashMap::len)
            .sum()
    }
}

/// A single-consumer subscription handle. Dropping it removes the
/// subscriber from the bus.
pub struct Subscription {
    key: SubKey,
    id: u64,
    inner: Arc<Inner>,
    rx: mpsc::Receiver<WriteEvent>,
}

impl Subscription {
    /// Receives the next event, or `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<WriteEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut tables = self.inner.write();
        if let Some(subscribers) = tables.subscribers.get_mut(&self.key) {
            subscribers.remove(&self.id);
            if subscribers.is_empty() {
                tables.subscribers.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(stream: &str, position: i64, global_position: i64) -> WriteEvent {
        WriteEvent {
            namespace: "default".to_string(),
            stream: stream.to_string(),
            category: crate::stream_name::category(stream).to_string(),
            position,
            global_position,
        }
    }

    #[tokio::test]
    async fn events_reach_all_matching_scopes() {
        let bus = PubSub::new();
        let mut by_stream = bus.subscribe_stream("default", "account-1");
        let mut by_category = bus.subscribe_category("default", "account");
        let mut all = bus.subscribe_namespace("default");
        let mut other_stream = bus.subscribe_stream("default", "account-2");
        let mut other_namespace = bus.subscribe_namespace("tenant2");

        bus.publish(&event("account-1", 0, 1));

        assert_eq!(by_stream.recv().await.unwrap().position, 0);
        assert_eq!(by_category.recv().await.unwrap().stream, "account-1");
        assert_eq!(all.recv().await.unwrap().global_position, 1);
        assert!(other_stream.rx.try_recv().is_err());
        assert!(other_namespace.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn delivery_is_fifo_per_subscriber() {
        let bus = PubSub::new();
        let mut sub = bus.subscribe_stream("default", "account-1");

        for position in 0..5 {
            bus.publish(&event("account-1", position, position + 1));
        }
        for position in 0..5 {
            assert_eq!(sub.recv().await.unwrap().position, position);
        }
    }

    #[tokio::test]
    async fn full_channels_drop_instead_of_blocking() {
        let bus = PubSub::new();
        let mut sub = bus.subscribe_stream("default", "account-1");

        let overflow = SUBSCRIBER_CAPACITY as i64 + 10;
        for position in 0..overflow {
            bus.publish(&event("account-1", position, position + 1));
        }

        let mut received = 0;
        while sub.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_CAPACITY);
    }

    #[tokio::test]
    async fn dropping_a_subscription_removes_it() {
        let bus = PubSub::new();
        let sub = bus.subscribe_stream("default", "account-1");
        let other = bus.subscribe_category("default", "account");
        assert_eq!(bus.subscriber_count(), 2);

        drop(sub);
        assert_eq!(bus.subscriber_count(), 1);
        drop(other);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_wakes_waiting_subscribers() {
        let bus = PubSub::new();
        let mut sub = bus.subscribe_namespace("default");

        let waiter = tokio::spawn(async move { sub.recv().await });
        bus.close();
        assert_eq!(waiter.await.unwrap(), None);

        // Late subscribers see a closed channel immediately.
        let mut late = bus.subscribe_namespace("default");
        assert_eq!(late.recv().await, None);
    }
}
