//! Bus configuration.

use std::time::Duration;

use crate::error::{BusError, Result};

/// What the connector does when asserting an exchange fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TopologyFailurePolicy {
    /// Log the failure and report the connection as usable anyway.
    #[default]
    Degrade,
    /// Log the failure and never report the connection as usable.
    /// The bus stays disconnected until an operator intervenes.
    Halt,
}

/// Settings for a [`RabbitEventBus`](crate::RabbitEventBus).
///
/// # Default Settings
///
/// - Reconnect debounce: 100ms, forced after 2s
/// - Subscribe retry delay while disconnected: 1s
/// - Retry queue: unbounded
/// - Topology failures: [`TopologyFailurePolicy::Degrade`]
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub url: String,
    pub service_name: String,
    pub event_types: Vec<String>,
    pub reconnect_debounce: Duration,
    pub reconnect_max_wait: Duration,
    pub subscribe_retry_delay: Duration,
    pub retry_queue_capacity: Option<usize>,
    pub topology_failure_policy: TopologyFailurePolicy,
}

impl BusConfig {
    pub fn new(url: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            service_name: service_name.into(),
            event_types: Vec::new(),
            reconnect_debounce: Duration::from_millis(100),
            reconnect_max_wait: Duration::from_secs(2),
            subscribe_retry_delay: Duration::from_secs(1),
            retry_queue_capacity: None,
            topology_failure_policy: TopologyFailurePolicy::Degrade,
        }
    }

    /// Event types this service publishes or subscribes to.
    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = event_types.into_iter().map(Into::into).collect();
        self
    }

    /// Quiet window and upper bound for coalescing reconnect attempts.
    pub fn with_reconnect_debounce(mut self, debounce: Duration, max_wait: Duration) -> Self {
        self.reconnect_debounce = debounce;
        self.reconnect_max_wait = max_wait;
        self
    }

    pub fn with_subscribe_retry_delay(mut self, delay: Duration) -> Self {
        self.subscribe_retry_delay = delay;
        self
    }

    /// Bound the number of publishes held while disconnected.
    pub fn with_retry_queue_capacity(mut self, capacity: usize) -> Self {
        self.retry_queue_capacity = Some(capacity);
        self
    }

    pub fn with_topology_failure_policy(mut self, policy: TopologyFailurePolicy) -> Self {
        self.topology_failure_policy = policy;
        self
    }

    pub fn declares(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|declared| declared == event_type)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(BusError::MissingServiceName);
        }
        if self.event_types.iter().any(|t| t.is_empty()) {
            return Err(BusError::EmptyEventType);
        }
        Ok(())
    }
}
