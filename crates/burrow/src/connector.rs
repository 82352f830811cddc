//! Broker connector: one physical connection and its channels.
//!
//! A connector is created for every connection attempt and thrown away when
//! that connection dies. It asserts topology, publishes, consumes and
//! acknowledges, and reports connectivity on the observer's [`StateSender`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerChannel, BrokerConnection, BrokerResult, Delivery, ExchangeKind};
use crate::config::{BusConfig, TopologyFailurePolicy};
use crate::event::{Event, EventHandler};
use crate::framing::{consumer_queue_name, exchange_name, to_envelope, Envelope};
use crate::observer::{StateChange, StateSender};

/// Handlers keyed by event type, shared with the owning bus.
pub type SubscriptionRegistry = DashMap<String, Arc<dyn EventHandler>>;

pub struct AmqpConnector {
    url: String,
    service_name: String,
    subscribe_retry_delay: Duration,
    topology_failure_policy: TopologyFailurePolicy,
    sender: StateSender,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    destroyed: Arc<AtomicBool>,
    subscribed: Mutex<SmallVec<[String; 8]>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl AmqpConnector {
    pub fn new(config: &BusConfig, sender: StateSender) -> Arc<Self> {
        Arc::new(Self {
            url: config.url.clone(),
            service_name: config.service_name.clone(),
            subscribe_retry_delay: config.subscribe_retry_delay,
            topology_failure_policy: config.topology_failure_policy,
            sender,
            connection: RwLock::new(None),
            destroyed: Arc::new(AtomicBool::new(false)),
            subscribed: Mutex::new(SmallVec::new()),
            consumers: Mutex::new(Vec::new()),
        })
    }

    /// Connect, assert an exchange per event type, then bind every
    /// subscription currently in `subscriptions`.
    pub async fn setup(
        self: &Arc<Self>,
        broker: &dyn Broker,
        event_types: &[String],
        subscriptions: &SubscriptionRegistry,
    ) {
        let connection = match broker.connect(&self.url).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(url = %self.url, error = %e, "connection failed, retrying");
                self.disconnected(e.to_string());
                return;
            }
        };

        if self.is_destroyed() {
            let _ = connection.close().await;
            return;
        }

        let sender = self.sender.clone();
        let destroyed = self.destroyed.clone();
        connection.on_event(Box::new(move |event| {
            if !destroyed.load(Ordering::SeqCst) {
                sender.send(StateChange::not_connected(format!("{event:?}")));
            }
        }));
        *self.connection.write() = Some(connection.clone());

        if !self.assert_exchanges(connection.as_ref(), event_types).await
            && self.topology_failure_policy == TopologyFailurePolicy::Halt
        {
            error!(
                service = %self.service_name,
                "topology incomplete, connection will not be used until reconfigured"
            );
            return;
        }
        self.connected();

        let pending: Vec<(String, Arc<dyn EventHandler>)> = subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (event_type, handler) in pending {
            self.subscribe(&event_type, handler).await;
        }
    }

    async fn assert_exchanges(&self, connection: &dyn BrokerConnection, event_types: &[String]) -> bool {
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "can't open channel to create exchanges");
                return false;
            }
        };

        let results = join_all(event_types.iter().map(|event_type| {
            let channel = channel.clone();
            let name = exchange_name(event_type);
            async move {
                channel
                    .assert_exchange(&name, ExchangeKind::Fanout)
                    .await
                    .map_err(|e| (name, e))
            }
        }))
        .await;

        let failures: Vec<_> = results.into_iter().filter_map(Result::err).collect();
        for (exchange, e) in &failures {
            error!(exchange = %exchange, error = %e, "can't create exchange");
        }
        failures.is_empty()
    }

    /// Consume `event_type` with `handler`.
    ///
    /// Without a connection the call is retried every
    /// `subscribe_retry_delay` until one exists or the connector goes away.
    pub async fn subscribe(self: &Arc<Self>, event_type: &str, handler: Arc<dyn EventHandler>) {
        if self.is_destroyed() {
            return;
        }

        match self.connection() {
            Some(connection) => self.bind_consumer(connection, event_type, handler).await,
            None => {
                warn!(event_type, "no connection, can't subscribe, trying again soon");
                self.schedule_subscribe_retry(event_type.to_owned(), handler);
            }
        }
    }

    fn schedule_subscribe_retry(self: &Arc<Self>, event_type: String, handler: Arc<dyn EventHandler>) {
        let weak = Arc::downgrade(self);
        let delay = self.subscribe_retry_delay;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                let Some(this) = weak.upgrade() else {
                    return;
                };
                if this.is_destroyed() {
                    return;
                }
                if let Some(connection) = this.connection() {
                    this.bind_consumer(connection, &event_type, handler).await;
                    return;
                }
                debug!(event_type = %event_type, "still no connection for subscribe");
            }
        });
    }

    async fn bind_consumer(
        &self,
        connection: Arc<dyn BrokerConnection>,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) {
        if !self.claim(event_type) {
            debug!(event_type, "already consuming on this connection");
            return;
        }

        let queue = consumer_queue_name(event_type, &self.service_name);
        let exchange = exchange_name(event_type);

        match open_consumer(connection.as_ref(), &queue, &exchange).await {
            Ok((channel, deliveries)) => {
                debug!(event_type, queue = %queue, "subscribed");
                let task = tokio::spawn(consume(channel, deliveries, handler, event_type.to_owned()));
                if self.is_destroyed() {
                    task.abort();
                } else {
                    self.consumers.lock().push(task);
                }
            }
            Err(e) => {
                error!(event_type, queue = %queue, error = %e, "can't create subscriber queue");
                self.release(event_type);
            }
        }
    }

    /// Publish `event` on a fresh channel. Never fails loudly: any problem
    /// is logged and reported as `false`.
    pub async fn publish(&self, event: &Event) -> bool {
        let Some(connection) = self.connection() else {
            return false;
        };

        let exchange = exchange_name(&event.event_type);
        let result: anyhow::Result<()> = async {
            let body = to_envelope(event.clone()).encode()?;
            let channel = connection.create_channel().await?;
            let published = channel.publish(&exchange, "", body).await;
            if let Err(e) = channel.close().await {
                debug!(error = %e, "publish channel close failed");
            }
            Ok(published?)
        }
        .await;

        match result {
            Ok(()) => {
                debug!(event_id = %event.id, exchange = %exchange, "event published");
                true
            }
            Err(e) => {
                error!(event_id = %event.id, exchange = %exchange, error = %e, "couldn't publish message");
                false
            }
        }
    }

    /// Close the connection without reporting it as lost. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        for task in self.consumers.lock().drain(..) {
            task.abort();
        }

        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "close after destroy failed");
            }
        }
        info!(service = %self.service_name, "connector destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }

    /// Event types this connector consumes.
    pub fn subscribed_events(&self) -> Vec<String> {
        self.subscribed.lock().to_vec()
    }

    fn connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection.read().clone()
    }

    fn claim(&self, event_type: &str) -> bool {
        let mut subscribed = self.subscribed.lock();
        if subscribed.iter().any(|t| t == event_type) {
            return false;
        }
        subscribed.push(event_type.to_owned());
        true
    }

    fn release(&self, event_type: &str) {
        self.subscribed.lock().retain(|t| t != event_type);
    }

    fn connected(&self) {
        if !self.is_destroyed() {
            self.sender.send(StateChange::connected());
        }
    }

    fn disconnected(&self, reason: String) {
        if !self.is_destroyed() {
            self.sender.send(StateChange::not_connected(reason));
        }
    }
}

async fn open_consumer(
    connection: &dyn BrokerConnection,
    queue: &str,
    exchange: &str,
) -> BrokerResult<(Arc<dyn BrokerChannel>, BoxStream<'static, Delivery>)> {
    let channel = connection.create_channel().await?;
    channel.assert_queue(queue).await?;
    channel.bind_queue(queue, exchange, "").await?;
    let deliveries = channel.consume(queue).await?;
    Ok((channel, deliveries))
}

async fn consume(
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: BoxStream<'static, Delivery>,
    handler: Arc<dyn EventHandler>,
    event_type: String,
) {
    while let Some(delivery) = deliveries.next().await {
        handle_delivery(channel.as_ref(), handler.as_ref(), &event_type, delivery).await;
    }
    debug!(event_type = %event_type, "consumer stream ended");
}

/// Decode, dispatch and settle one delivery.
///
/// Undecodable bodies are dropped (nack, no requeue) without reaching the
/// handler. Handler failures, panics included, are requeued.
pub async fn handle_delivery(
    channel: &dyn BrokerChannel,
    handler: &dyn EventHandler,
    event_type: &str,
    delivery: Delivery,
) {
    let envelope = match Envelope::decode(&delivery.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(event_type, delivery_tag = delivery.delivery_tag, error = %e, "can't parse message, dropping");
            if let Err(e) = channel.nack(&delivery, false, false).await {
                warn!(delivery_tag = delivery.delivery_tag, error = %e, "nack failed");
            }
            return;
        }
    };

    let meta = envelope.meta;
    let event_id = envelope.event.id.clone();
    let outcome = AssertUnwindSafe(async { handler.handle(envelope.event).await })
        .catch_unwind()
        .await;
    let failure = match outcome {
        Ok(Ok(true)) => None,
        Ok(Ok(false)) => Some("handler reported failure".to_owned()),
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(format!("handler panicked: {}", panic_message(panic.as_ref()))),
    };

    let settled = match failure {
        None => channel.ack(&delivery).await,
        Some(reason) => {
            warn!(
                event_type,
                event_id = %event_id,
                delivery_tag = delivery.delivery_tag,
                redelivered = delivery.redelivered,
                attempts = meta.attempts,
                retries = meta.retries,
                failures = meta.failures,
                reason = %reason,
                "event handler failure, requeueing"
            );
            channel.nack(&delivery, false, true).await
        }
    };

    if let Err(e) = settled {
        warn!(delivery_tag = delivery.delivery_tag, error = %e, "failed to settle delivery");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
