//! In-process bus.
//!
//! Hands published events straight to the registered handler. No broker,
//! no queueing, no redelivery. Useful for unit tests of code that only
//! depends on the [`EventBus`] traits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use burrow::{BusError, Event, EventBus, EventHandler, EventPublisher, EventSubscriber, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

pub struct InProcessEventBus {
    service_name: String,
    event_types: Vec<String>,
    handlers: DashMap<String, Arc<dyn EventHandler>>,
    published: Mutex<Vec<Event>>,
    handled: AtomicUsize,
    destroyed: AtomicBool,
}

impl InProcessEventBus {
    pub fn new<I, S>(service_name: impl Into<String>, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service_name: service_name.into(),
            event_types: event_types.into_iter().map(Into::into).collect(),
            handlers: DashMap::new(),
            published: Mutex::new(Vec::new()),
            handled: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Run the handler for `event` and return its verdict.
    ///
    /// `false` when no handler is registered or the handler failed.
    pub async fn deliver(&self, event: Event) -> bool {
        self.published.lock().push(event.clone());

        let handler = self.handlers.get(&event.event_type).map(|h| h.value().clone());
        let Some(handler) = handler else {
            debug!(event_type = %event.event_type, "no handler registered");
            return false;
        };

        match handler.handle(event).await {
            Ok(verdict) => {
                if verdict {
                    self.handled.fetch_add(1, Ordering::SeqCst);
                }
                verdict
            }
            Err(e) => {
                warn!(error = %e, "event handler failed");
                false
            }
        }
    }

    /// Every event passed to [`deliver`](Self::deliver) or `publish`.
    pub fn published(&self) -> Vec<Event> {
        self.published.lock().clone()
    }

    /// Events a handler accepted.
    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventPublisher for InProcessEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        if event.event_type.is_empty() {
            return Err(BusError::EmptyEventType);
        }
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BusError::Destroyed);
        }
        self.deliver(event).await;
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for InProcessEventBus {
    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<usize> {
        if event_type.is_empty() {
            return Err(BusError::EmptyEventType);
        }
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BusError::Destroyed);
        }
        if !self.event_types.iter().any(|t| t == event_type) {
            return Err(BusError::UndeclaredEventType(event_type.to_owned()));
        }

        match self.handlers.entry(event_type.to_owned()) {
            Entry::Occupied(_) => Err(BusError::HandlerAlreadySet(event_type.to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(self.handlers.len())
            }
        }
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    fn event_types(&self) -> &[String] {
        &self.event_types
    }

    fn service_name(&self) -> &str {
        &self.service_name
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.handlers.clear();
    }
}
