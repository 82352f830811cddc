//! # Burrow
//!
//! A resilient publish/subscribe client over AMQP-style brokers. Services
//! publish events and subscribe to event types without managing broker
//! connectivity, reconnection, or message loss during outages.
//!
//! ## Core Concepts
//!
//! - [`Event`] = a fact, identified by a unique id, carrying a JSON payload
//! - [`EventHandler`] = decides whether a delivered event was processed
//!   (`Ok(true)` acks, anything else requeues)
//!
//! The key principle: **a publish resolves only after the broker accepted
//! it.** If the broker is unreachable the publish waits in a retry queue and
//! resolves after reconnection.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!     │ publish() / subscribe()
//!     ▼
//! RabbitEventBus ──────────────┬──────────► RetryQueue
//!     │                        │                 ▲
//!     │ Option<AmqpConnector>  │ on_connect ─────┘ drain
//!     ▼                        │ on_disconnect ─── drop connector
//! AmqpConnector ──► broker     │ on_start_reconnect ─► Debouncer ─► connect
//!     │                        │
//!     └─ StateChange ──► ConnectionObserver
//! ```
//!
//! ## Key Invariants
//!
//! 1. **At most one connector** - The bus never holds two live connectors
//! 2. **At most one handler per event type** - A second subscribe is rejected
//! 3. **Subscriptions outlive connectors** - Every new connector binds them all
//! 4. **Ordered notifications** - Connectivity changes are handled one at a
//!    time, in the order they were sent
//!
//! ## Guarantees
//!
//! - **At-least-once delivery**: a failing handler causes redelivery, so
//!   handlers may see duplicates
//! - **No ordering across event types**
//! - **Poison messages are dropped**: a body that does not decode is nacked
//!   without requeue and the handler never sees it
//!
//! ## Broker Topology
//!
//! - One fanout exchange per event type: `event__<eventType>`
//! - One queue per event type and subscribing service:
//!   `consumer__<eventType>__<serviceName>`, bound with an empty routing key

// Core modules
mod bus;
mod config;
mod debounce;
mod error;
mod event;

pub mod broker;
pub mod connector;
pub mod framing;
pub mod observer;
pub mod retry_queue;

// Re-export bus types
pub use bus::RabbitEventBus;

// Re-export configuration
pub use config::{BusConfig, TopologyFailurePolicy};

// Re-export the debouncer used for reconnects
pub use debounce::Debouncer;

// Re-export error types
pub use error::{BrokerError, BusError, EnvelopeError, Result};

// Re-export event types and the bus contract
pub use event::{Event, EventBus, EventHandler, EventPublisher, EventSubscriber};

// Re-export broker primitives
pub use broker::{
    Broker, BrokerChannel, BrokerConnection, ConnectionEvent, ConnectionListener, Delivery,
    ExchangeKind,
};

// Re-export framing helpers
pub use framing::{consumer_queue_name, exchange_name, to_envelope, DeliveryMeta, Envelope};

// Re-export connection lifecycle types
pub use observer::{ConnectionObserver, ConnectionOwner, ConnectivityState, StateChange, StateSender};

// Re-export retry queue types
pub use retry_queue::{PublishCompletion, QueuePublisher, QueuedPublish, RetryQueue};

// Re-export connector types
pub use connector::{AmqpConnector, SubscriptionRegistry};

// Re-export commonly used external types
pub use async_trait::async_trait;
