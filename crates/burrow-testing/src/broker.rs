//! In-memory broker.
//!
//! Implements the broker primitives with fanout exchanges, named queues,
//! bindings, one consumer per queue and ack/nack bookkeeping. Faults can be
//! injected: refuse connections, fail exchange assertions, fail publishes,
//! sever live connections.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use burrow::broker::BrokerResult;
use burrow::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, ConnectionEvent, ConnectionListener,
    Delivery, ExchangeKind,
};
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// A message accepted by an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

/// How a consumer settled a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack { delivery_tag: u64 },
    Nack { delivery_tag: u64, multiple: bool, requeue: bool },
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Delivery>,
    consumer: Option<(u64, mpsc::UnboundedSender<Delivery>)>,
    unacked: HashMap<u64, Delivery>,
}

impl QueueState {
    fn enqueue(&mut self, delivery: Delivery) {
        if let Some((_, consumer)) = &self.consumer {
            self.unacked.insert(delivery.delivery_tag, delivery.clone());
            if consumer.send(delivery.clone()).is_ok() {
                return;
            }
            self.unacked.remove(&delivery.delivery_tag);
            self.consumer = None;
        }
        self.pending.push_back(delivery);
    }
}

struct BrokerState {
    available: AtomicBool,
    fail_exchange_assertions: AtomicBool,
    failing_publishes: AtomicUsize,
    redeliver_requeued: AtomicBool,
    publish_delay: Mutex<Option<Duration>>,
    connect_attempts: AtomicUsize,
    channels_opened: AtomicUsize,
    next_connection_id: AtomicU64,
    next_delivery_tag: AtomicU64,
    urls: Mutex<Vec<String>>,
    exchanges: DashMap<String, ExchangeKind>,
    bindings: DashMap<String, Vec<String>>,
    queues: Mutex<HashMap<String, QueueState>>,
    published: Mutex<Vec<PublishedMessage>>,
    settlements: Mutex<Vec<Settlement>>,
    connections: Mutex<Vec<Weak<ConnectionShared>>>,
}

impl BrokerState {
    fn delivery(&self, body: Vec<u8>, redelivered: bool) -> Delivery {
        Delivery {
            delivery_tag: self.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1,
            redelivered,
            body,
        }
    }

    fn route(&self, exchange: &str, body: &[u8]) {
        let targets = self
            .bindings
            .get(exchange)
            .map(|queues| queues.value().clone())
            .unwrap_or_default();

        let mut queues = self.queues.lock();
        for queue in targets {
            let delivery = self.delivery(body.to_vec(), false);
            queues.entry(queue).or_default().enqueue(delivery);
        }
    }

    fn drop_consumers(&self, connection_id: u64) {
        let mut queues = self.queues.lock();
        for queue in queues.values_mut() {
            if matches!(queue.consumer, Some((id, _)) if id == connection_id) {
                queue.consumer = None;
                let unacked: Vec<Delivery> = queue.unacked.drain().map(|(_, d)| d).collect();
                for delivery in unacked {
                    queue.pending.push_back(Delivery {
                        redelivered: true,
                        ..delivery
                    });
                }
            }
        }
    }
}

/// Broker living entirely in process memory.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                available: AtomicBool::new(true),
                fail_exchange_assertions: AtomicBool::new(false),
                failing_publishes: AtomicUsize::new(0),
                redeliver_requeued: AtomicBool::new(true),
                publish_delay: Mutex::new(None),
                connect_attempts: AtomicUsize::new(0),
                channels_opened: AtomicUsize::new(0),
                next_connection_id: AtomicU64::new(0),
                next_delivery_tag: AtomicU64::new(0),
                urls: Mutex::new(Vec::new()),
                exchanges: DashMap::new(),
                bindings: DashMap::new(),
                queues: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                settlements: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A broker that refuses connections until [`set_available`](Self::set_available).
    pub fn unavailable() -> Self {
        let broker = Self::new();
        broker.set_available(false);
        broker
    }

    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_exchange_assertions(&self, fail: bool) {
        self.state
            .fail_exchange_assertions
            .store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Hold every publish started from now on for `delay` before it is
    /// checked and routed. `None` stops delaying new publishes.
    pub fn delay_publishes(&self, delay: Option<Duration>) {
        *self.state.publish_delay.lock() = delay;
    }

    /// Whether a nack with requeue delivers the message again.
    pub fn redeliver_requeued(&self, redeliver: bool) {
        self.state
            .redeliver_requeued
            .store(redeliver, Ordering::SeqCst);
    }

    /// Kill every open connection the way a network failure would:
    /// listeners see an error followed by a close.
    pub fn sever_connections(&self) -> usize {
        let live: Vec<Arc<ConnectionShared>> = {
            let mut connections = self.state.connections.lock();
            connections.retain(|c| c.strong_count() > 0);
            connections.iter().filter_map(Weak::upgrade).collect()
        };

        let mut severed = 0;
        for connection in live {
            if connection.shut(&self.state, &[
                ConnectionEvent::Error("connection reset by peer".into()),
                ConnectionEvent::Close,
            ]) {
                severed += 1;
            }
        }
        debug!(severed, "severed connections");
        severed
    }

    /// Put a raw body on a queue, bypassing exchanges.
    pub fn deliver_raw(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let delivery = self.state.delivery(body.into(), false);
        self.state
            .queues
            .lock()
            .entry(queue.to_owned())
            .or_default()
            .enqueue(delivery);
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connected_urls(&self) -> Vec<String> {
        self.state.urls.lock().clone()
    }

    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.is_open())
            .count()
    }

    pub fn exchanges(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.exchanges.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state.exchanges.get(name).map(|kind| *kind)
    }

    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Queues bound to `exchange`.
    pub fn bindings(&self, exchange: &str) -> Vec<String> {
        self.state
            .bindings
            .get(exchange)
            .map(|queues| queues.value().clone())
            .unwrap_or_default()
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state
            .queues
            .lock()
            .get(queue)
            .is_some_and(|q| q.consumer.is_some())
    }

    /// Messages waiting on `queue` for a consumer.
    pub fn pending(&self, queue: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.pending.len())
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().clone()
    }

    pub fn published_to(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.state
            .published
            .lock()
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.state.settlements.lock().clone()
    }

    pub fn acks(&self) -> usize {
        self.settlements()
            .iter()
            .filter(|s| matches!(s, Settlement::Ack { .. }))
            .count()
    }

    pub fn nacks(&self, requeue: bool) -> usize {
        self.settlements()
            .iter()
            .filter(|s| matches!(s, Settlement::Nack { requeue: r, .. } if *r == requeue))
            .count()
    }

    /// Open a connection directly, for driving channels in tests.
    pub async fn open(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        self.connect("memory://").await
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, url: &str) -> BrokerResult<Arc<dyn BrokerConnection>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.state.urls.lock().push(url.to_owned());

        if !self.state.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(format!("{url}: connection refused")));
        }

        let shared = Arc::new(ConnectionShared {
            id: self.state.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1,
            open: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
        });
        self.state.connections.lock().push(Arc::downgrade(&shared));

        Ok(Arc::new(InMemoryConnection {
            shared,
            state: self.state.clone(),
        }))
    }
}

struct ConnectionShared {
    id: u64,
    open: AtomicBool,
    listeners: Mutex<Vec<ConnectionListener>>,
}

impl ConnectionShared {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close once and notify listeners. Returns `false` if already closed.
    fn shut(&self, state: &BrokerState, events: &[ConnectionEvent]) -> bool {
        if !self.open.swap(false, Ordering::SeqCst) {
            return false;
        }
        state.drop_consumers(self.id);

        let listeners = std::mem::take(&mut *self.listeners.lock());
        for event in events {
            for listener in &listeners {
                listener(event.clone());
            }
        }
        true
    }
}

struct InMemoryConnection {
    shared: Arc<ConnectionShared>,
    state: Arc<BrokerState>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        if !self.shared.is_open() {
            return Err(BrokerError::Closed);
        }
        self.state.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryChannel {
            connection: self.shared.clone(),
            state: self.state.clone(),
            open: AtomicBool::new(true),
        }))
    }

    fn on_event(&self, listener: ConnectionListener) {
        self.shared.listeners.lock().push(listener);
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.shared.shut(&self.state, &[ConnectionEvent::Close]) {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }
}

struct InMemoryChannel {
    connection: Arc<ConnectionShared>,
    state: Arc<BrokerState>,
    open: AtomicBool,
}

impl InMemoryChannel {
    fn usable(&self) -> BrokerResult<()> {
        if self.open.load(Ordering::SeqCst) && self.connection.is_open() {
            Ok(())
        } else {
            Err(BrokerError::Channel("channel closed".into()))
        }
    }

    fn settle(&self, settlement: Settlement) {
        self.state.settlements.lock().push(settlement);
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()> {
        self.usable()?;
        if self.state.fail_exchange_assertions.load(Ordering::SeqCst) {
            return Err(BrokerError::Topology(format!(
                "access refused for exchange '{name}'"
            )));
        }
        match self.state.exchanges.get(name).map(|k| *k) {
            Some(existing) if existing != kind => Err(BrokerError::Topology(format!(
                "exchange '{name}' exists as {}",
                existing.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                self.state.exchanges.insert(name.to_owned(), kind);
                Ok(())
            }
        }
    }

    async fn assert_queue(&self, name: &str) -> BrokerResult<()> {
        self.usable()?;
        self.state
            .queues
            .lock()
            .entry(name.to_owned())
            .or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, _routing_key: &str) -> BrokerResult<()> {
        self.usable()?;
        if !self.state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Topology(format!("no exchange '{exchange}'")));
        }
        if !self.state.queues.lock().contains_key(queue) {
            return Err(BrokerError::Topology(format!("no queue '{queue}'")));
        }

        let mut bound = self.state.bindings.entry(exchange.to_owned()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_owned());
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BrokerResult<BoxStream<'static, Delivery>> {
        self.usable()?;
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut queues = self.state.queues.lock();
            let Some(state) = queues.get_mut(queue) else {
                return Err(BrokerError::Topology(format!("no queue '{queue}'")));
            };
            state.consumer = Some((self.connection.id, tx));
            let backlog: Vec<Delivery> = state.pending.drain(..).collect();
            for delivery in backlog {
                state.enqueue(delivery);
            }
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> BrokerResult<()> {
        let delay = *self.state.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.usable()?;
        let failing = self
            .state
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BrokerError::Publish("injected publish failure".into()));
        }
        if !self.state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Channel(format!("no exchange '{exchange}'")));
        }

        self.state.route(exchange, &body);
        self.state.published.lock().push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body,
        });
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.usable()?;
        self.settle(Settlement::Ack {
            delivery_tag: delivery.delivery_tag,
        });
        let mut queues = self.state.queues.lock();
        for queue in queues.values_mut() {
            queue.unacked.remove(&delivery.delivery_tag);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, multiple: bool, requeue: bool) -> BrokerResult<()> {
        self.usable()?;
        self.settle(Settlement::Nack {
            delivery_tag: delivery.delivery_tag,
            multiple,
            requeue,
        });

        let redeliver = requeue && self.state.redeliver_requeued.load(Ordering::SeqCst);
        let mut queues = self.state.queues.lock();
        for queue in queues.values_mut() {
            if queue.unacked.remove(&delivery.delivery_tag).is_some() && redeliver {
                let again = self.state.delivery(delivery.body.clone(), true);
                queue.enqueue(again);
            }
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}
