//! Thin publish/subscribe facade the rest of the core talks to instead of
//! touching a broker client directly. `KafkaEventBus` is the production
//! implementation; `InMemoryEventBus` backs unit tests for callers that only
//! care about dispatch, not transport.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

pub const KEYSET_UPDATED: &str = "keyset_updated";
pub const USER_DELETED: &str = "user_deleted";

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Wire envelope every event travels in, independent of transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    pub source: String,
    pub event_type: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, payload: impl Serialize) -> Result<Self, EventBusError> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            source: source.into(),
            event_type: event_type.into(),
            metadata: HashMap::new(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EventBusError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// `user_deleted` payload: cascade-delete every token owned by `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDeletedPayload {
    pub user_id: String,
}

/// `keyset_updated` carries no data; its arrival is the signal.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KeysetUpdatedPayload {}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> Result<(), EventBusError>;

    /// Subscribe `queue` (the consumer group) to `event_type`. Returns a
    /// channel fed by a background task; matching envelopes for other event
    /// types on the same topic are dropped, not buffered.
    async fn subscribe(&self, queue: &str, event_type: &str) -> Result<mpsc::Receiver<Envelope>, EventBusError>;
}

const SUBSCRIBE_CHANNEL_CAPACITY: usize = 128;

pub struct KafkaEventBus {
    producer: rdkafka::producer::FutureProducer,
    topic: String,
    brokers: String,
}

impl KafkaEventBus {
    pub fn new(brokers: &str, topic: &str) -> Result<Self, EventBusError> {
        use rdkafka::config::ClientConfig;
        use rdkafka::producer::FutureProducer;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", "auth-server")
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| EventBusError::Publish(format!("failed to build kafka producer: {e}")))?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
            brokers: brokers.to_string(),
        })
    }
}

#[async_trait]
impl EventBus for KafkaEventBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), EventBusError> {
        use rdkafka::producer::FutureRecord;

        let payload = serde_json::to_vec(&envelope)?;
        let record = FutureRecord::to(&self.topic)
            .key(&envelope.event_type)
            .payload(&payload);

        self.producer
            .send(record, Duration::from_secs(30))
            .await
            .map_err(|(e, _)| EventBusError::Publish(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, queue: &str, event_type: &str) -> Result<mpsc::Receiver<Envelope>, EventBusError> {
        use rdkafka::config::ClientConfig;
        use rdkafka::consumer::{Consumer, StreamConsumer};
        use rdkafka::message::Message;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", queue)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "10000")
            .create()
            .map_err(|e| EventBusError::Subscribe(format!("failed to build kafka consumer: {e}")))?;

        consumer
            .subscribe(&[&self.topic])
            .map_err(|e| EventBusError::Subscribe(format!("failed to subscribe to {}: {e}", self.topic)))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBE_CHANNEL_CAPACITY);
        let wanted = event_type.to_string();
        let topic = self.topic.clone();

        tokio::spawn(async move {
            loop {
                match consumer.recv().await {
                    Ok(message) => {
                        let Some(payload) = message.payload() else { continue };
                        match serde_json::from_slice::<Envelope>(payload) {
                            Ok(envelope) if envelope.event_type == wanted => {
                                if tx.send(envelope).await.is_err() {
                                    return;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!(%topic, error = %e, "dropping undecodable event envelope"),
                        }
                    }
                    Err(e) => {
                        error!(%topic, queue = %wanted, error = %e, "kafka consume error, retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// In-process test double: a broadcast fan-out keyed by event type, with no
/// network dependency. Used by callers' own unit tests, not by production code.
pub struct InMemoryEventBus {
    sender: tokio::sync::broadcast::Sender<Envelope>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(SUBSCRIBE_CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), EventBusError> {
        // No subscribers is not an error: events are fire-and-forget.
        let _ = self.sender.send(envelope);
        Ok(())
    }

    async fn subscribe(&self, _queue: &str, event_type: &str) -> Result<mpsc::Receiver<Envelope>, EventBusError> {
        let mut broadcast_rx = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBE_CHANNEL_CAPACITY);
        let wanted = event_type.to_string();

        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(envelope) if envelope.event_type == wanted => {
                        if tx.send(envelope).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Handler = Arc<dyn Fn(Envelope) -> HandlerFuture + Send + Sync>;

/// Composition-time registry: one subscription per (queue, event_type),
/// fanning out to whatever handler each component registered.
pub struct Dispatcher {
    bus: Arc<dyn EventBus>,
    queue: String,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn EventBus>, queue: impl Into<String>) -> Self {
        Self { bus, queue: queue.into() }
    }

    pub async fn register(&self, event_type: &str, handler: Handler) -> Result<(), EventBusError> {
        let mut rx = self.bus.subscribe(&self.queue, event_type).await?;
        let event_type = event_type.to_string();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                handler(envelope).await;
            }
            warn!(event_type = %event_type, "event dispatch channel closed");
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_bus_delivers_only_matching_event_type() {
        let bus = InMemoryEventBus::new();
        let mut rx = bus.subscribe("test-queue", KEYSET_UPDATED).await.unwrap();

        bus.publish(Envelope::new("test", USER_DELETED, UserDeletedPayload { user_id: "u1".into() }).unwrap())
            .await
            .unwrap();
        bus.publish(Envelope::new("test", KEYSET_UPDATED, KeysetUpdatedPayload::default()).unwrap())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.event_type, KEYSET_UPDATED);
    }

    #[tokio::test]
    async fn envelope_round_trips_typed_payload() {
        let envelope = Envelope::new("test", USER_DELETED, UserDeletedPayload { user_id: "u1".into() }).unwrap();
        let decoded: UserDeletedPayload = envelope.payload_as().unwrap();
        assert_eq!(decoded.user_id, "u1");
    }

    #[tokio::test]
    async fn dispatcher_fans_out_to_registered_handler() {
        let bus = Arc::new(InMemoryEventBus::new());
        let dispatcher = Dispatcher::new(bus.clone(), "test-queue");
        let (done_tx, mut done_rx) = mpsc::channel(1);

        dispatcher
            .register(
                USER_DELETED,
                Arc::new(move |envelope: Envelope| {
                    let done_tx = done_tx.clone();
                    Box::pin(async move {
                        let payload: UserDeletedPayload = envelope.payload_as().unwrap();
                        let _ = done_tx.send(payload.user_id).await;
                    })
                }),
            )
            .await
            .unwrap();

        bus.publish(Envelope::new("test", USER_DELETED, UserDeletedPayload { user_id: "u42".into() }).unwrap())
            .await
            .unwrap();

        let user_id = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user_id, "u42");
    }
}
