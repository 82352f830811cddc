//! Events and the publish/subscribe contract.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BusError, Result};

/// A fact that happened, identified by a globally unique id.
///
/// Events are immutable once created. The bus never mutates them; the wire
/// form uses `eventType` as the type field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub event_type: String,
    pub created: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    /// Create an event with a fresh UUID v4 id, stamped now.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            created: Utc::now(),
            payload,
        }
    }

    /// Create an event from any serializable payload.
    pub fn from_payload<P: Serialize>(event_type: impl Into<String>, payload: &P) -> Result<Self> {
        let payload =
            serde_json::to_value(payload).map_err(|e| BusError::InvalidPayload(e.to_string()))?;
        Ok(Self::new(event_type, payload))
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| BusError::InvalidPayload(e.to_string()))
    }
}

/// Handles delivered events of one type.
///
/// `Ok(true)` acknowledges the message. `Ok(false)` and `Err(_)` both reject
/// it and the broker redelivers it later.
///
/// Any async closure `Fn(Event) -> impl Future<Output = anyhow::Result<bool>>`
/// is a handler.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event) -> anyhow::Result<bool>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> anyhow::Result<bool> {
        (self)(event).await
    }
}

/// Publishing side of a bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Resolves once the event has been accepted for delivery.
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Subscribing side of a bus.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Register the handler for `event_type`.
    ///
    /// Returns the number of registered subscriptions.
    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<usize>;
}

/// A bus that can publish, subscribe and be shut down.
#[async_trait]
pub trait EventBus: EventPublisher + EventSubscriber {
    /// Event types this bus publishes and subscribes to.
    fn event_types(&self) -> &[String];

    /// Service identity used to name consumer queues.
    fn service_name(&self) -> &str;

    async fn destroy(&self);
}
