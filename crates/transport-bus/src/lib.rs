use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod stomp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("bus protocol error: {0}")]
    Protocol(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Opens connections to a publish/subscribe broker.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> BusResult<Arc<dyn BusConnection>>;
}

/// A single broker connection. Every subscription opened on it ends (its
/// `recv` yields `None`) once the connection is lost.
#[async_trait]
pub trait BusConnection: Send + Sync {
    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
    async fn close(&self);
    fn is_open(&self) -> bool;
}

#[derive(Debug)]
pub struct BusSubscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl BusSubscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message on the topic, or `None` when the underlying connection dropped.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// In-memory broker for tests and single-process wiring.
///
/// Delivery is FIFO per publisher/subscriber pair, matching what a real broker
/// guarantees, and the publisher's own subscriptions receive its messages too.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

#[derive(Default)]
struct LocalBusInner {
    topics: parking_lot::RwLock<HashMap<String, Vec<LocalSubscriber>>>,
    next_connection: AtomicU64,
    epoch: AtomicU64,
    unavailable: AtomicBool,
    connects: AtomicU64,
    journal: parking_lot::Mutex<Vec<BusMessage>>,
}

struct LocalSubscriber {
    connection: u64,
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every `connect` fails; existing connections are untouched.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Simulates a broker outage: every open connection is severed and all
    /// subscriptions end.
    pub fn drop_connections(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.topics.write().clear();
    }

    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Every message published on `topic` so far, in publish order.
    pub fn published(&self, topic: &str) -> Vec<BusMessage> {
        self.inner
            .journal
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    fn deliver(&self, message: BusMessage) {
        self.inner.journal.lock().push(message.clone());
        let mut topics = self.inner.topics.write();
        if let Some(subscribers) = topics.get_mut(&message.topic) {
            subscribers.retain(|sub| sub.tx.send(message.clone()).is_ok());
        }
    }

    fn remove_connection(&self, connection: u64) {
        let mut topics = self.inner.topics.write();
        for subscribers in topics.values_mut() {
            subscribers.retain(|sub| sub.connection != connection);
        }
    }
}

#[async_trait]
impl BusConnector for LocalBus {
    async fn connect(&self) -> BusResult<Arc<dyn BusConnection>> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("local bus offline".into()));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(LocalConnection {
            id,
            epoch: self.inner.epoch.load(Ordering::SeqCst),
            bus: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LocalConnection {
    id: u64,
    epoch: u64,
    bus: LocalBus,
    closed: AtomicBool,
}

#[async_trait]
impl BusConnection for LocalConnection {
    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription> {
        if !self.is_open() {
            return Err(BusError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus
            .inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(LocalSubscriber {
                connection: self.id,
                tx,
            });
        Ok(BusSubscription::new(topic, rx))
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        if !self.is_open() {
            return Err(BusError::Closed);
        }
        self.bus.deliver(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.bus.remove_connection(self.id);
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.epoch == self.bus.inner.epoch.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let conn = bus.connect().await.expect("connect");
        let mut sub = conn.subscribe("signal/42").await.expect("subscribe");
        conn.publish("signal/42", Bytes::from_static(b"ping"))
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "signal/42");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = LocalBus::new();
        let conn = bus.connect().await.unwrap();
        let mut a = conn.subscribe("a").await.unwrap();
        let mut b = conn.subscribe("b").await.unwrap();
        conn.publish("b", Bytes::from_static(b"for-b")).unwrap();
        conn.publish("a", Bytes::from_static(b"for-a")).unwrap();
        assert_eq!(a.recv().await.unwrap().payload, Bytes::from_static(b"for-a"));
        assert_eq!(b.recv().await.unwrap().payload, Bytes::from_static(b"for-b"));
    }

    #[tokio::test]
    async fn outage_ends_subscriptions_and_blocks_connects() {
        let bus = LocalBus::new();
        let conn = bus.connect().await.unwrap();
        let mut sub = conn.subscribe("t").await.unwrap();

        bus.set_available(false);
        bus.drop_connections();

        assert!(sub.recv().await.is_none());
        assert!(!conn.is_open());
        assert!(matches!(
            conn.publish("t", Bytes::new()),
            Err(BusError::Closed)
        ));
        assert!(matches!(
            bus.connect().await,
            Err(BusError::Unavailable(_))
        ));

        bus.set_available(true);
        let conn = bus.connect().await.unwrap();
        assert!(conn.is_open());
        assert_eq!(bus.connect_count(), 2);
    }

    #[tokio::test]
    async fn closing_a_connection_removes_only_its_subscribers() {
        let bus = LocalBus::new();
        let first = bus.connect().await.unwrap();
        let second = bus.connect().await.unwrap();
        let _s1 = first.subscribe("room").await.unwrap();
        let mut s2 = second.subscribe("room").await.unwrap();
        assert_eq!(bus.subscriber_count("room"), 2);

        first.close().await;
        assert_eq!(bus.subscriber_count("room"), 1);

        second.publish("room", Bytes::from_static(b"x")).unwrap();
        assert!(s2.recv().await.is_some());
        assert_eq!(bus.published("room").len(), 1);
    }
}
