//! Connection state observer.
//!
//! Connectors report connectivity on a [`StateSender`]. A single task owns
//! the receiving end and turns each notification into lifecycle callbacks on
//! the owner, strictly one at a time and in arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Connectivity of the active connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Connected,
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub new_state: ConnectivityState,
    pub message: Option<String>,
}

impl StateChange {
    pub fn connected() -> Self {
        Self {
            new_state: ConnectivityState::Connected,
            message: None,
        }
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self {
            new_state: ConnectivityState::NotConnected,
            message: Some(message.into()),
        }
    }
}

/// Send side handed to connectors.
#[derive(Debug, Clone)]
pub struct StateSender {
    tx: mpsc::UnboundedSender<StateChange>,
}

impl StateSender {
    /// Returns `false` once the observer is gone.
    pub fn send(&self, change: StateChange) -> bool {
        self.tx.send(change).is_ok()
    }
}

/// Receives lifecycle callbacks from a [`ConnectionObserver`].
pub trait ConnectionOwner: Send + Sync + 'static {
    fn on_connect(self: &Arc<Self>);
    fn on_disconnect(self: &Arc<Self>);
    fn on_start_reconnect(self: &Arc<Self>);
}

pub struct ConnectionObserver {
    connected: Arc<AtomicBool>,
    sender: StateSender,
    task: JoinHandle<()>,
}

impl ConnectionObserver {
    /// Start the notification loop for `owner`.
    ///
    /// The loop holds only a weak reference and stops when the owner is
    /// dropped or the observer itself is dropped.
    pub fn spawn<O: ConnectionOwner>(owner: Weak<O>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(observe(rx, owner, connected.clone()));

        Self {
            connected,
            sender: StateSender { tx },
            task,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn sender(&self) -> StateSender {
        self.sender.clone()
    }

    /// Stop the loop. Pending notifications are discarded.
    pub fn stop(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for ConnectionObserver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn observe<O: ConnectionOwner>(
    mut rx: mpsc::UnboundedReceiver<StateChange>,
    owner: Weak<O>,
    connected: Arc<AtomicBool>,
) {
    while let Some(change) = rx.recv().await {
        let Some(owner) = owner.upgrade() else {
            debug!("connection owner dropped, observer exiting");
            break;
        };

        match change.new_state {
            ConnectivityState::NotConnected => {
                debug!(reason = ?change.message, "connection lost");
                connected.store(false, Ordering::SeqCst);
                owner.on_disconnect();
                owner.on_start_reconnect();
            }
            ConnectivityState::Connected => {
                info!("connection confirmed");
                connected.store(true, Ordering::SeqCst);
                owner.on_connect();
            }
        }
    }
}
