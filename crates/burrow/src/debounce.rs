//! Trailing-edge debounce with a maximum wait.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Coalesces bursts of [`trigger`](Self::trigger) calls into one action.
///
/// The action fires once no trigger has arrived for `wait`, or `max_wait`
/// after the first trigger of a burst, whichever comes first.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl Debouncer {
    pub fn spawn<F>(wait: Duration, max_wait: Duration, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, wait, max_wait.max(wait), action));
        Self { tx, task }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Cancel any pending action and stop accepting triggers.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<F: Fn()>(
    mut rx: mpsc::UnboundedReceiver<()>,
    wait: Duration,
    max_wait: Duration,
    action: F,
) {
    while rx.recv().await.is_some() {
        let deadline = Instant::now() + max_wait;
        let mut fire_at = (Instant::now() + wait).min(deadline);

        loop {
            tokio::select! {
                _ = sleep_until(fire_at) => break,
                next = rx.recv() => match next {
                    Some(()) => fire_at = (Instant::now() + wait).min(deadline),
                    None => return,
                },
            }
        }

        action();
    }
}
