//! Error types.
//!
//! Callers of the bus only ever see [`BusError`]. Transport problems are
//! reported by broker primitives as [`BrokerError`] and absorbed by the
//! connector, which turns them into reconnects or re-queued publishes.

use thiserror::Error;

/// Errors visible to publishers and subscribers.
///
/// Every variant except [`BusError::Destroyed`] and
/// [`BusError::RetryQueueFull`] is a programmer error and is never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("event type must not be empty")]
    EmptyEventType,

    #[error("service name must not be empty")]
    MissingServiceName,

    #[error("event type '{0}' was not declared when the bus was registered")]
    UndeclaredEventType(String),

    #[error("handler already set for event type '{0}'")]
    HandlerAlreadySet(String),

    #[error("event bus has been destroyed")]
    Destroyed,

    #[error("retry queue is full ({capacity} pending publishes)")]
    RetryQueueFull { capacity: usize },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Failures reported by broker primitives.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("topology error: {0}")]
    Topology(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("connection closed")]
    Closed,
}

/// Failures while framing an event for the wire.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;
