//! # Burrow Testing
//!
//! Test doubles for the burrow event bus.
//!
//! - [`InMemoryBroker`] implements the broker primitives in process memory,
//!   with fault injection for outages, topology and publish failures
//! - [`InProcessEventBus`] implements the bus traits by calling handlers
//!   directly
//!
//! ## Example
//!
//! ```ignore
//! use burrow::{BusConfig, RabbitEventBus};
//! use burrow_testing::InMemoryBroker;
//!
//! let broker = InMemoryBroker::new();
//! let bus = RabbitEventBus::register(
//!     Arc::new(broker.clone()),
//!     BusConfig::new("memory://", "billing").with_event_types(["order:created"]),
//! )?;
//!
//! broker.sever_connections();
//! // publishes now wait in the retry queue until the bus reconnects
//! ```

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

mod broker;
mod in_process;

pub use broker::{InMemoryBroker, PublishedMessage, Settlement};
pub use in_process::InProcessEventBus;

static TRACING: Once = Once::new();

/// Install a test-friendly `tracing` subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `burrow=debug`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("burrow=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
///
/// Returns whether the condition held.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `future` for at most `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(timeout, future).await.ok()
}
