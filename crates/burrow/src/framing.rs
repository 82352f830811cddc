//! Broker naming and wire framing.

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;
use crate::event::Event;

/// Default maximum delivery attempts recorded in a fresh envelope.
pub const DEFAULT_RETRIES: u32 = 10;

/// Fanout exchange an event type is published to.
pub fn exchange_name(event_type: &str) -> String {
    format!("event__{event_type}")
}

/// Queue holding one service's copy of an event type.
pub fn consumer_queue_name(event_type: &str, service_name: &str) -> String {
    format!("consumer__{event_type}__{service_name}")
}

/// Delivery bookkeeping carried next to the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMeta {
    pub attempts: u32,
    pub retries: u32,
    pub failures: u32,
}

impl Default for DeliveryMeta {
    fn default() -> Self {
        Self {
            attempts: 0,
            retries: DEFAULT_RETRIES,
            failures: 0,
        }
    }
}

/// The transport message: one event plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: Event,
    pub meta: DeliveryMeta,
}

impl Envelope {
    /// UTF-8 JSON body for the broker.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn decode(body: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(body).map_err(EnvelopeError::Decode)
    }
}

/// Wrap an event for publishing.
pub fn to_envelope(event: Event) -> Envelope {
    Envelope {
        event,
        meta: DeliveryMeta::default(),
    }
}
