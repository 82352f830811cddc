//! The resilient bus.
//!
//! [`RabbitEventBus`] hides connectivity from its callers. Publishes made
//! while the broker is unreachable wait in the [`RetryQueue`] and complete
//! after the next successful connection drains it. Subscriptions are kept
//! in a registry owned by the bus and bound again on every new connector.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::config::BusConfig;
use crate::connector::{AmqpConnector, SubscriptionRegistry};
use crate::debounce::Debouncer;
use crate::error::{BusError, Result};
use crate::event::{Event, EventBus, EventHandler, EventPublisher, EventSubscriber};
use crate::observer::{ConnectionObserver, ConnectionOwner};
use crate::retry_queue::{QueuePublisher, QueuedPublish, RetryQueue};

/// Publish/subscribe over a broker that may come and go.
///
/// # Example
///
/// ```ignore
/// let config = BusConfig::new("amqp://localhost", "billing")
///     .with_event_types(["order:created"]);
/// let bus = RabbitEventBus::register(broker, config)?;
///
/// bus.subscribe("order:created", Arc::new(|event: Event| async move {
///     println!("{}", event.payload);
///     Ok(true)
/// }))
/// .await?;
///
/// bus.publish(Event::new("order:created", json!({"amount": 10}))).await?;
/// ```
pub struct RabbitEventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    broker: Arc<dyn Broker>,
    config: BusConfig,
    connector: Mutex<Option<Arc<AmqpConnector>>>,
    observer: ConnectionObserver,
    queue: RetryQueue,
    subscriptions: Arc<SubscriptionRegistry>,
    reconnect: Debouncer,
    destroyed: AtomicBool,
    /// Bumped on every confirmed connection.
    generation: AtomicU64,
    this: Weak<BusInner>,
}

impl RabbitEventBus {
    /// Declare the event types and service identity, then start connecting.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(broker: Arc<dyn Broker>, config: BusConfig) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new_cyclic(|weak: &Weak<BusInner>| {
            let target = weak.clone();
            let reconnect = Debouncer::spawn(
                config.reconnect_debounce,
                config.reconnect_max_wait,
                move || {
                    if let Some(inner) = target.upgrade() {
                        inner.connect();
                    }
                },
            );

            BusInner {
                broker,
                queue: RetryQueue::with_capacity(config.retry_queue_capacity),
                config,
                connector: Mutex::new(None),
                observer: ConnectionObserver::spawn(weak.clone()),
                subscriptions: Arc::new(SubscriptionRegistry::new()),
                reconnect,
                destroyed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                this: weak.clone(),
            }
        });

        info!(
            service = %inner.config.service_name,
            event_types = ?inner.config.event_types,
            "event bus registered"
        );
        inner.connect();

        Ok(Self { inner })
    }

    /// Resolves once the broker has accepted `event`.
    ///
    /// While disconnected the event waits in the retry queue, so this may
    /// take as long as the outage lasts.
    pub async fn publish(&self, event: Event) -> Result<()> {
        if event.event_type.is_empty() {
            return Err(BusError::EmptyEventType);
        }
        if self.inner.is_destroyed() {
            return Err(BusError::Destroyed);
        }
        if !self.inner.config.declares(&event.event_type) {
            warn!(event_type = %event.event_type, "publishing an undeclared event type");
        }

        let (item, rx) = QueuedPublish::new(event);
        self.inner.publish_queued(item).await;
        rx.await.unwrap_or(Err(BusError::Destroyed))
    }

    /// Register the one handler for `event_type`.
    ///
    /// Returns the number of registered subscriptions.
    pub async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<usize> {
        if event_type.is_empty() {
            return Err(BusError::EmptyEventType);
        }
        if self.inner.is_destroyed() {
            return Err(BusError::Destroyed);
        }
        if !self.inner.config.declares(event_type) {
            return Err(BusError::UndeclaredEventType(event_type.to_owned()));
        }

        match self.inner.subscriptions.entry(event_type.to_owned()) {
            Entry::Occupied(_) => return Err(BusError::HandlerAlreadySet(event_type.to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(handler.clone());
            }
        }
        let count = self.inner.subscriptions.len();
        debug!(event_type, count, "subscription registered");

        if let Some(connector) = self.inner.current_connector() {
            connector.subscribe(event_type, handler).await;
        }
        Ok(count)
    }

    /// Close the connection, stop reconnecting and fail queued publishes.
    /// Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.reconnect.stop();
        let connector = self.inner.connector.lock().take();
        if let Some(connector) = connector {
            connector.destroy().await;
        }
        self.inner.observer.stop();

        let failed = self.inner.queue.fail_all(BusError::Destroyed);
        info!(
            service = %self.inner.config.service_name,
            failed_publishes = failed,
            "event bus destroyed"
        );
    }

    pub fn is_connected(&self) -> bool {
        self.inner.observer.is_connected()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Publishes waiting for a connection.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Event types with a registered handler, sorted.
    pub fn subscribed_event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        types.sort();
        types
    }

    /// Event types the live connector is consuming, if there is one.
    pub fn connector_subscriptions(&self) -> Vec<String> {
        self.inner
            .current_connector()
            .map(|connector| connector.subscribed_events())
            .unwrap_or_default()
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }
}

impl BusInner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn current_connector(&self) -> Option<Arc<AmqpConnector>> {
        self.connector.lock().clone()
    }

    /// Re-submit everything in the retry queue on a background task.
    fn spawn_drain(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            let drained = inner.queue.drain(inner.as_ref()).await;
            if drained > 0 {
                info!(drained, "retry queue drained");
            }
        });
    }

    /// Replace the connector slot with a fresh connector and set it up.
    fn connect(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }

        let connector = AmqpConnector::new(&self.config, self.observer.sender());
        let previous = self.connector.lock().replace(connector.clone());
        if let Some(previous) = previous {
            tokio::spawn(async move { previous.destroy().await });
        }
        if self.is_destroyed() {
            // destroy() ran between the check above and the swap.
            let orphan = self.connector.lock().take();
            if let Some(orphan) = orphan {
                tokio::spawn(async move { orphan.destroy().await });
            }
            return;
        }

        debug!(url = %self.config.url, "attempting connection");
        let broker = self.broker.clone();
        let event_types = self.config.event_types.clone();
        let subscriptions = self.subscriptions.clone();
        tokio::spawn(async move {
            connector
                .setup(broker.as_ref(), &event_types, &subscriptions)
                .await;
        });
    }
}

#[async_trait]
impl QueuePublisher for BusInner {
    async fn publish_queued(&self, item: QueuedPublish) {
        if self.is_destroyed() {
            item.completion.fail(BusError::Destroyed);
            return;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let connector = if self.observer.is_connected() {
            self.current_connector()
        } else {
            None
        };
        if let Some(connector) = connector {
            if connector.publish(&item.event).await {
                item.completion.succeed();
                return;
            }
        }

        let event_id = item.event.id.clone();
        self.queue.push(item);
        if self.is_destroyed() {
            self.queue.fail_all(BusError::Destroyed);
            return;
        }

        // A connection confirmed while this publish was in flight has
        // already drained the queue without this item.
        if self.generation.load(Ordering::SeqCst) != generation && self.observer.is_connected() {
            if let Some(inner) = self.this.upgrade() {
                debug!(event_id = %event_id, "connection changed during publish, draining again");
                inner.spawn_drain();
            }
        }
    }
}

impl ConnectionOwner for BusInner {
    fn on_connect(self: &Arc<Self>) {
        info!(
            service = %self.config.service_name,
            queued = self.queue.len(),
            "connected to broker"
        );
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.spawn_drain();
    }

    fn on_disconnect(self: &Arc<Self>) {
        let previous = self.connector.lock().take();
        if let Some(previous) = previous {
            warn!(service = %self.config.service_name, "disconnected from broker");
            tokio::spawn(async move { previous.destroy().await });
        }
    }

    fn on_start_reconnect(self: &Arc<Self>) {
        if !self.is_destroyed() {
            self.reconnect.trigger();
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        let connector = self.connector.get_mut().take();
        if let (Some(connector), Ok(handle)) = (connector, tokio::runtime::Handle::try_current()) {
            handle.spawn(async move { connector.destroy().await });
        }
    }
}

#[async_trait]
impl EventPublisher for RabbitEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        RabbitEventBus::publish(self, event).await
    }
}

#[async_trait]
impl EventSubscriber for RabbitEventBus {
    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<usize> {
        RabbitEventBus::subscribe(self, event_type, handler).await
    }
}

#[async_trait]
impl EventBus for RabbitEventBus {
    fn event_types(&self) -> &[String] {
        &self.inner.config.event_types
    }

    fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    async fn destroy(&self) {
        RabbitEventBus::destroy(self).await
    }
}
