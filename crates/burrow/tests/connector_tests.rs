//! `AmqpConnector` and delivery handling against the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use burrow::connector::handle_delivery;
use burrow::{
    consumer_queue_name, to_envelope, AmqpConnector, BrokerChannel, BusConfig, ConnectionObserver,
    ConnectionOwner, Delivery, Envelope, Event, EventHandler, ExchangeKind, SubscriptionRegistry,
    TopologyFailurePolicy,
};
use burrow_testing::{init_tracing, wait_until, InMemoryBroker};
use serde_json::json;

const SETTLE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Recorder {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    reconnects: AtomicUsize,
}

impl ConnectionOwner for Recorder {
    fn on_connect(self: &Arc<Self>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnect(self: &Arc<Self>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_start_reconnect(self: &Arc<Self>) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    broker: InMemoryBroker,
    config: BusConfig,
    recorder: Arc<Recorder>,
    _observer: ConnectionObserver,
    connector: Arc<AmqpConnector>,
    registry: SubscriptionRegistry,
}

impl Fixture {
    fn new(broker: InMemoryBroker, config: BusConfig) -> Self {
        init_tracing();
        let recorder = Arc::new(Recorder::default());
        let observer = ConnectionObserver::spawn(Arc::downgrade(&recorder));
        let connector = AmqpConnector::new(&config, observer.sender());
        Self {
            broker,
            config,
            recorder,
            _observer: observer,
            connector,
            registry: SubscriptionRegistry::new(),
        }
    }

    async fn setup(&self) {
        self.connector
            .setup(&self.broker, &self.config.event_types, &self.registry)
            .await;
    }

    fn connects(&self) -> usize {
        self.recorder.connects.load(Ordering::SeqCst)
    }

    fn disconnects(&self) -> usize {
        self.recorder.disconnects.load(Ordering::SeqCst)
    }
}

fn config() -> BusConfig {
    BusConfig::new("amqp://localhost", "billing")
        .with_event_types(["order:created", "order:paid"])
        .with_subscribe_retry_delay(Duration::from_millis(20))
}

fn accept_all() -> Arc<dyn EventHandler> {
    Arc::new(|_: Event| async move { anyhow::Ok(true) })
}

// ============================================================================
// Setup
// ============================================================================

#[tokio::test]
async fn test_setup_asserts_fanout_exchange_per_event_type() {
    let fixture = Fixture::new(InMemoryBroker::new(), config());

    fixture.setup().await;

    assert_eq!(
        fixture.broker.exchanges(),
        vec!["event__order:created".to_owned(), "event__order:paid".to_owned()]
    );
    assert_eq!(
        fixture.broker.exchange_kind("event__order:paid"),
        Some(ExchangeKind::Fanout)
    );
    assert!(fixture.connector.is_connected());
    assert!(wait_until(SETTLE, || fixture.connects() == 1).await);
}

#[tokio::test]
async fn test_failed_connect_reports_not_connected() {
    let fixture = Fixture::new(InMemoryBroker::unavailable(), config());

    fixture.setup().await;

    assert!(wait_until(SETTLE, || fixture.disconnects() == 1).await);
    assert_eq!(fixture.recorder.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.connects(), 0);
    assert!(!fixture.connector.is_connected());
}

#[tokio::test]
async fn test_degrade_policy_reports_connected_after_exchange_failure() {
    let broker = InMemoryBroker::new();
    broker.fail_exchange_assertions(true);
    let fixture = Fixture::new(broker, config());

    fixture.setup().await;

    assert!(wait_until(SETTLE, || fixture.connects() == 1).await);
    assert!(fixture.broker.exchanges().is_empty());
}

#[tokio::test]
async fn test_halt_policy_withholds_connected_after_exchange_failure() {
    let broker = InMemoryBroker::new();
    broker.fail_exchange_assertions(true);
    let fixture = Fixture::new(
        broker,
        config().with_topology_failure_policy(TopologyFailurePolicy::Halt),
    );

    fixture.setup().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(fixture.connects(), 0);
    assert_eq!(fixture.disconnects(), 0);
}

#[tokio::test]
async fn test_setup_binds_registered_subscriptions() {
    let fixture = Fixture::new(InMemoryBroker::new(), config());
    fixture
        .registry
        .insert("order:created".to_owned(), accept_all());

    fixture.setup().await;

    let queue = consumer_queue_name("order:created", "billing");
    assert!(fixture.broker.has_consumer(&queue));
    assert_eq!(fixture.broker.bindings("event__order:created"), vec![queue]);
    assert_eq!(
        fixture.connector.subscribed_events(),
        vec!["order:created".to_owned()]
    );
}

// ============================================================================
// Subscribe
// ============================================================================

#[tokio::test]
async fn test_subscribe_twice_binds_once() {
    let fixture = Fixture::new(InMemoryBroker::new(), config());
    fixture.setup().await;
    let channels_after_setup = fixture.broker.channels_opened();

    fixture.connector.subscribe("order:paid", accept_all()).await;
    fixture.connector.subscribe("order:paid", accept_all()).await;

    assert_eq!(fixture.broker.channels_opened(), channels_after_setup + 1);
    assert_eq!(fixture.broker.bindings("event__order:paid").len(), 1);
    assert_eq!(fixture.connector.subscribed_events(), vec!["order:paid".to_owned()]);
}

#[tokio::test]
async fn test_subscribe_without_connection_retries_until_connected() {
    let fixture = Fixture::new(InMemoryBroker::new(), config());

    fixture.connector.subscribe("order:paid", accept_all()).await;
    assert!(fixture.connector.subscribed_events().is_empty());

    fixture.setup().await;

    let queue = consumer_queue_name("order:paid", "billing");
    assert!(wait_until(SETTLE, || fixture.broker.has_consumer(&queue)).await);
}

#[tokio::test]
async fn test_subscribe_retry_stops_after_destroy() {
    let fixture = Fixture::new(InMemoryBroker::new(), config());

    fixture.connector.subscribe("order:paid", accept_all()).await;
    fixture.connector.destroy().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(fixture.broker.queues().is_empty());
    assert_eq!(fixture.broker.connect_attempts(), 0);
}

#[tokio::test]
async fn test_failed_queue_binding_releases_claim() {
    let broker = InMemoryBroker::new();
    broker.fail_exchange_assertions(true);
    let fixture = Fixture::new(broker, config());
    fixture.setup().await;

    // No exchange exists, so binding fails.
    fixture.connector.subscribe("order:paid", accept_all()).await;
    assert!(fixture.connector.subscribed_events().is_empty());

    fixture.broker.fail_exchange_assertions(false);
    let channel = fixture.broker.open().await.unwrap().create_channel().await.unwrap();
    channel
        .assert_exchange("event__order:paid", ExchangeKind::Fanout)
        .await
        .unwrap();

    fixture.connector.subscribe("order:paid", accept_all()).await;
    assert_eq!(fixture.connector.subscribed_events(), vec!["order:paid".to_owned()]);
}

// ============================================================================
// Publish
// ============================================================================

#[tokio::test]
async fn test_publish_without_connection_is_false() {
    let fixture = Fixture::new(InMemoryBroker::new(), config());

    let published = fixture
        .connector
        .publish(&Event::new("order:created", json!({})))
        .await;

    assert!(!published);
    assert!(fixture.broker.published().is_empty());
}

#[tokio::test]
async fn test_publish_sends_envelope_on_fresh_channel() {
    let fixture = Fixture::new(InMemoryBroker::new(), config());
    fixture.setup().await;
    let channels_before = fixture.broker.channels_opened();
    let event = Event::new("order:created", json!({ "amount": 10 }));

    assert!(fixture.connector.publish(&event).await);

    assert_eq!(fixture.broker.channels_opened(), channels_before + 1);
    let published = fixture.broker.published_to("event__order:created");
    assert_eq!(published.len(), 1);
    let envelope = Envelope::decode(&published[0].body).unwrap();
    assert_eq!(envelope, to_envelope(event));
}

#[tokio::test]
async fn test_publish_failure_is_false() {
    let fixture = Fixture::new(InMemoryBroker::new(), config());
    fixture.setup().await;
    fixture.broker.fail_next_publishes(1);

    let published = fixture
        .connector
        .publish(&Event::new("order:created", json!({})))
        .await;

    assert!(!published);
}

// ============================================================================
// Destroy
// ============================================================================

#[tokio::test]
async fn test_destroy_closes_connection_quietly() {
    let fixture = Fixture::new(InMemoryBroker::new(), config());
    fixture.setup().await;
    assert!(wait_until(SETTLE, || fixture.connects() == 1).await);

    fixture.connector.destroy().await;
    fixture.connector.destroy().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(fixture.connector.is_destroyed());
    assert!(!fixture.connector.is_connected());
    assert_eq!(fixture.broker.open_connections(), 0);
    assert_eq!(fixture.disconnects(), 0);
}

#[tokio::test]
async fn test_connection_loss_reports_not_connected() {
    let fixture = Fixture::new(InMemoryBroker::new(), config());
    fixture.setup().await;

    fixture.broker.sever_connections();

    // One signal per error and close notification.
    assert!(wait_until(SETTLE, || fixture.disconnects() == 2).await);
}

// ============================================================================
// Delivery handling
// ============================================================================

async fn channel(broker: &InMemoryBroker) -> Arc<dyn BrokerChannel> {
    broker.open().await.unwrap().create_channel().await.unwrap()
}

fn delivery(body: Vec<u8>) -> Delivery {
    Delivery {
        delivery_tag: 1,
        redelivered: false,
        body,
    }
}

fn encoded(event: Event) -> Vec<u8> {
    to_envelope(event).encode().unwrap()
}

fn counting<F>(verdict: F) -> (Arc<dyn EventHandler>, Arc<AtomicUsize>)
where
    F: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
{
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler: Arc<dyn EventHandler> = Arc::new(move |_: Event| {
        counter.fetch_add(1, Ordering::SeqCst);
        let result = verdict();
        async move { result }
    });
    (handler, calls)
}

#[tokio::test]
async fn test_handler_success_acks() {
    let broker = InMemoryBroker::new();
    let channel = channel(&broker).await;
    let (handler, calls) = counting(|| Ok(true));

    handle_delivery(
        channel.as_ref(),
        handler.as_ref(),
        "order:created",
        delivery(encoded(Event::new("order:created", json!({})))),
    )
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.acks(), 1);
    assert_eq!(broker.nacks(true) + broker.nacks(false), 0);
}

#[tokio::test]
async fn test_handler_false_nacks_with_requeue() {
    let broker = InMemoryBroker::new();
    let channel = channel(&broker).await;
    let (handler, _) = counting(|| Ok(false));

    handle_delivery(
        channel.as_ref(),
        handler.as_ref(),
        "order:created",
        delivery(encoded(Event::new("order:created", json!({})))),
    )
    .await;

    assert_eq!(broker.acks(), 0);
    assert_eq!(broker.nacks(true), 1);
    assert_eq!(broker.nacks(false), 0);
}

#[tokio::test]
async fn test_handler_error_nacks_with_requeue() {
    let broker = InMemoryBroker::new();
    let channel = channel(&broker).await;
    let (handler, _) = counting(|| Err(anyhow::anyhow!("database unavailable")));

    handle_delivery(
        channel.as_ref(),
        handler.as_ref(),
        "order:created",
        delivery(encoded(Event::new("order:created", json!({})))),
    )
    .await;

    assert_eq!(broker.acks(), 0);
    assert_eq!(broker.nacks(true), 1);
}

#[tokio::test]
async fn test_handler_panic_nacks_with_requeue() {
    let broker = InMemoryBroker::new();
    let channel = channel(&broker).await;
    let (handler, calls) = counting(|| panic!("handler blew up"));

    handle_delivery(
        channel.as_ref(),
        handler.as_ref(),
        "order:created",
        delivery(encoded(Event::new("order:created", json!({})))),
    )
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.acks(), 0);
    assert_eq!(broker.nacks(true), 1);
    assert_eq!(broker.nacks(false), 0);
}

#[tokio::test]
async fn test_undecodable_body_nacks_without_requeue() {
    let broker = InMemoryBroker::new();
    let channel = channel(&broker).await;
    let (handler, calls) = counting(|| Ok(true));

    for body in [b"not json".to_vec(), br#"{"event":{}}"#.to_vec(), Vec::new()] {
        handle_delivery(channel.as_ref(), handler.as_ref(), "order:created", delivery(body)).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(broker.nacks(false), 3);
    assert_eq!(broker.acks() + broker.nacks(true), 0);
}
