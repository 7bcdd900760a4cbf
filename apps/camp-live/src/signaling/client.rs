use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use transport_bus::{BusConnection, BusConnector, BusError, BusSubscription};

use super::message::{Signal, SignalingMessage};
use crate::config::Backoff;
use crate::error::SignalingError;

#[derive(Debug)]
pub enum SignalingEvent {
    Message(SignalingMessage),
    /// The bus came back after an outage and `rejoin` has been announced.
    Reconnected,
    /// Reconnect attempts ran out; the client is dead.
    Lost(SignalingError),
}

type ConnectionSlot = Arc<RwLock<Option<Arc<dyn BusConnection>>>>;

/// Session-topic signaling over a publish/subscribe bus.
///
/// Incoming messages are parsed, filtered (own messages, messages directed at
/// someone else, malformed payloads) and forwarded to the session actor as
/// [`SignalingEvent`]s. A supervisor task re-establishes the subscription
/// after an outage and re-announces with `rejoin`.
pub struct SignalingClient {
    local_id: String,
    topic: String,
    connection: ConnectionSlot,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect, subscribe to `topic` and announce with `join`. Retries with
    /// `backoff` before giving up.
    pub async fn connect(
        connector: Arc<dyn BusConnector>,
        topic: &str,
        local_id: &str,
        backoff: Backoff,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Result<Self, SignalingError> {
        let (connection, subscription) = open(connector.as_ref(), topic, &backoff).await?;
        let slot: ConnectionSlot = Arc::new(RwLock::new(Some(connection.clone())));
        publish_on(
            connection.as_ref(),
            topic,
            &SignalingMessage::new(local_id, Signal::Join { reply_to: None }),
        );
        tracing::info!(
            target = "camp_live::signaling",
            topic = %topic,
            peer = %local_id,
            "joined signaling topic"
        );

        let supervisor = tokio::spawn(supervise(Supervisor {
            connector,
            topic: topic.to_string(),
            local_id: local_id.to_string(),
            backoff,
            events,
            slot: slot.clone(),
        }, subscription));

        Ok(Self {
            local_id: local_id.to_string(),
            topic: topic.to_string(),
            connection: slot,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .read()
            .as_ref()
            .is_some_and(|connection| connection.is_open())
    }

    /// Fire-and-forget. Messages published while the bus is down are lost.
    pub fn publish(&self, signal: Signal, target: Option<&str>) {
        let mut message = SignalingMessage::new(self.local_id.clone(), signal);
        if let Some(target) = target {
            message = message.to(target);
        }
        let connection = self.connection.read().clone();
        match connection {
            Some(connection) => publish_on(connection.as_ref(), &self.topic, &message),
            None => tracing::debug!(
                target = "camp_live::signaling",
                kind = ?message.signal.kind(),
                "bus down; dropping outgoing signal"
            ),
        }
    }

    /// Courtesy `leave`, then stop listening. Idempotent.
    pub async fn close(&self) {
        let Some(supervisor) = self.supervisor.lock().take() else {
            return;
        };
        self.publish(Signal::Leave, None);
        supervisor.abort();
        let _ = supervisor.await;
        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            connection.close().await;
        }
        tracing::info!(
            target = "camp_live::signaling",
            topic = %self.topic,
            "left signaling topic"
        );
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.abort();
        }
    }
}

struct Supervisor {
    connector: Arc<dyn BusConnector>,
    topic: String,
    local_id: String,
    backoff: Backoff,
    events: mpsc::UnboundedSender<SignalingEvent>,
    slot: ConnectionSlot,
}

async fn supervise(ctx: Supervisor, mut subscription: BusSubscription) {
    loop {
        while let Some(message) = subscription.recv().await {
            if let Some(message) = filter_incoming(&ctx.local_id, &message.payload) {
                if ctx.events.send(SignalingEvent::Message(message)).is_err() {
                    return;
                }
            }
        }

        tracing::warn!(
            target = "camp_live::signaling",
            topic = %ctx.topic,
            "signaling subscription lost; reconnecting"
        );
        ctx.slot.write().take();

        match open(ctx.connector.as_ref(), &ctx.topic, &ctx.backoff).await {
            Ok((connection, fresh)) => {
                *ctx.slot.write() = Some(connection.clone());
                publish_on(
                    connection.as_ref(),
                    &ctx.topic,
                    &SignalingMessage::new(ctx.local_id.clone(), Signal::Rejoin),
                );
                tracing::info!(
                    target = "camp_live::signaling",
                    topic = %ctx.topic,
                    "signaling reconnected; rejoin announced"
                );
                if ctx.events.send(SignalingEvent::Reconnected).is_err() {
                    return;
                }
                subscription = fresh;
            }
            Err(err) => {
                tracing::error!(
                    target = "camp_live::signaling",
                    topic = %ctx.topic,
                    error = %err,
                    "signaling reconnect exhausted"
                );
                let _ = ctx.events.send(SignalingEvent::Lost(err));
                return;
            }
        }
    }
}

async fn open(
    connector: &dyn BusConnector,
    topic: &str,
    backoff: &Backoff,
) -> Result<(Arc<dyn BusConnection>, BusSubscription), SignalingError> {
    let attempts = backoff.attempts.max(1);
    let mut last = BusError::Closed;
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(backoff.delay(attempt - 1)).await;
        }
        let connection = match connector.connect().await {
            Ok(connection) => connection,
            Err(err) => {
                tracing::debug!(
                    target = "camp_live::signaling",
                    attempt = attempt + 1,
                    error = %err,
                    "bus connect failed"
                );
                last = err;
                continue;
            }
        };
        match connection.subscribe(topic).await {
            Ok(subscription) => return Ok((connection, subscription)),
            Err(err) => {
                tracing::debug!(
                    target = "camp_live::signaling",
                    attempt = attempt + 1,
                    error = %err,
                    "bus subscribe failed"
                );
                connection.close().await;
                last = err;
            }
        }
    }
    Err(SignalingError::Exhausted { attempts, last })
}

fn publish_on(connection: &dyn BusConnection, topic: &str, message: &SignalingMessage) {
    let payload: Bytes = match message.encode() {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(target = "camp_live::signaling", error = %err, "failed to encode signal");
            return;
        }
    };
    if let Err(err) = connection.publish(topic, payload) {
        tracing::debug!(
            target = "camp_live::signaling",
            kind = ?message.signal.kind(),
            error = %err,
            "signal publish failed"
        );
    }
}

fn filter_incoming(local_id: &str, payload: &[u8]) -> Option<SignalingMessage> {
    let message = match SignalingMessage::decode(payload) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(
                target = "camp_live::signaling",
                error = %err,
                "dropping malformed signaling message"
            );
            return None;
        }
    };
    if message.sender == local_id || !message.is_for(local_id) {
        return None;
    }
    tracing::trace!(
        target = "camp_live::signaling",
        sender = %message.sender,
        kind = ?message.signal.kind(),
        "signal received"
    );
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use transport_bus::LocalBus;

    fn backoff() -> Backoff {
        Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            attempts: 3,
        }
    }

    async fn client(
        bus: &LocalBus,
        id: &str,
    ) -> (SignalingClient, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = SignalingClient::connect(Arc::new(bus.clone()), "7", id, backoff(), tx)
            .await
            .expect("connect");
        (client, rx)
    }

    fn expect_message(event: Option<SignalingEvent>) -> SignalingMessage {
        match event {
            Some(SignalingEvent::Message(message)) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_is_announced_and_own_messages_filtered() {
        let bus = LocalBus::new();
        let (_alice, mut alice_rx) = client(&bus, "alice").await;
        let (bob, _bob_rx) = client(&bus, "bob").await;

        let joined = expect_message(alice_rx.recv().await);
        assert_eq!(joined.sender, "bob");
        assert_eq!(joined.signal, Signal::Join { reply_to: None });

        bob.publish(Signal::Leave, Some("carol"));
        bob.publish(Signal::Leave, Some("alice"));
        let leave = expect_message(alice_rx.recv().await);
        assert_eq!(leave.target.as_deref(), Some("alice"));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped() {
        let bus = LocalBus::new();
        let (_alice, mut alice_rx) = client(&bus, "alice").await;
        let raw = bus.connect().await.unwrap();
        raw.publish("7", Bytes::from_static(b"{not json")).unwrap();
        raw.publish("7", Bytes::from_static(br#"{"type":"leave","sender":"zed"}"#))
            .unwrap();
        assert_eq!(expect_message(alice_rx.recv().await).sender, "zed");
    }

    #[tokio::test]
    async fn close_publishes_leave_once() {
        let bus = LocalBus::new();
        let (alice, _rx) = client(&bus, "alice").await;
        alice.close().await;
        alice.close().await;
        let leaves = bus
            .published("7")
            .into_iter()
            .filter(|msg| msg.payload.as_ref().windows(7).any(|w| w == b"\"leave\""))
            .count();
        assert_eq!(leaves, 1);
        assert!(!alice.is_connected());
        assert_eq!(bus.subscriber_count("7"), 0);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn reconnect_announces_rejoin() {
        let bus = LocalBus::new();
        let (_alice, mut alice_rx) = client(&bus, "alice").await;

        bus.drop_connections();
        assert!(matches!(alice_rx.recv().await, Some(SignalingEvent::Reconnected)));
        let last = bus.published("7").pop().expect("rejoin published");
        let rejoin = SignalingMessage::decode(&last.payload).unwrap();
        assert_eq!(rejoin.signal, Signal::Rejoin);
        assert_eq!(bus.subscriber_count("7"), 1);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn reconnect_gives_up_after_budget() {
        let bus = LocalBus::new();
        let (alice, mut alice_rx) = client(&bus, "alice").await;
        let connects_before = bus.connect_count();

        bus.set_available(false);
        bus.drop_connections();
        match alice_rx.recv().await {
            Some(SignalingEvent::Lost(SignalingError::Exhausted { attempts, .. })) => {
                assert_eq!(attempts, 3)
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(bus.connect_count(), connects_before);
        assert!(!alice.is_connected());
    }

    #[tokio::test]
    async fn connect_fails_when_bus_unreachable() {
        let bus = LocalBus::new();
        bus.set_available(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result =
            SignalingClient::connect(Arc::new(bus), "7", "alice", backoff(), tx).await;
        assert!(matches!(result, Err(SignalingError::Exhausted { .. })));
    }
}
