//! Broker client primitives.
//!
//! The bus does not speak the wire protocol. It drives a broker client
//! through these traits; an AMQP binding implements them over its own
//! connection and channel types.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BrokerError;

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Exchange routing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Every bound queue receives every message.
    Fanout,
    Direct,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fanout => "fanout",
            Self::Direct => "direct",
            Self::Topic => "topic",
        }
    }
}

/// Connection-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Error(String),
    End,
    Close,
}

/// Called for every [`ConnectionEvent`] of a connection.
pub type ConnectionListener = Box<dyn Fn(ConnectionEvent) + Send + Sync>;

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// Entry point of a broker client.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> BrokerResult<Arc<dyn BrokerConnection>>;
}

/// One physical connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Register a listener for error, end and close notifications.
    fn on_event(&self, listener: ConnectionListener);

    async fn close(&self) -> BrokerResult<()>;
}

/// A channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()>;

    async fn assert_queue(&self, name: &str) -> BrokerResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    /// Start consuming; the stream ends when the channel or connection closes.
    async fn consume(&self, queue: &str) -> BrokerResult<BoxStream<'static, Delivery>>;

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> BrokerResult<()>;

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()>;

    async fn nack(&self, delivery: &Delivery, multiple: bool, requeue: bool) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}
