//! Buffer for publishes that could not be confirmed by the broker.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{BusError, Result};
use crate::event::Event;

/// Resolves the caller's pending publish exactly once.
#[derive(Debug)]
pub struct PublishCompletion {
    tx: oneshot::Sender<Result<()>>,
}

impl PublishCompletion {
    pub fn new() -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn succeed(self) {
        // The caller may have stopped waiting.
        let _ = self.tx.send(Ok(()));
    }

    pub fn fail(self, error: BusError) {
        let _ = self.tx.send(Err(error));
    }
}

/// A publish waiting for the broker to accept it.
#[derive(Debug)]
pub struct QueuedPublish {
    pub event: Event,
    pub completion: PublishCompletion,
}

impl QueuedPublish {
    pub fn new(event: Event) -> (Self, oneshot::Receiver<Result<()>>) {
        let (completion, rx) = PublishCompletion::new();
        (Self { event, completion }, rx)
    }
}

/// The publish path a drained item goes back through.
///
/// Implementations either complete the item or push it back onto the queue.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn publish_queued(&self, item: QueuedPublish);
}

/// FIFO of pending publishes, optionally bounded.
#[derive(Debug, Default)]
pub struct RetryQueue {
    items: Mutex<VecDeque<QueuedPublish>>,
    capacity: Option<usize>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Append an item. A full queue fails the item instead of holding it.
    pub fn push(&self, item: QueuedPublish) {
        let mut items = self.items.lock();
        if let Some(capacity) = self.capacity {
            if items.len() >= capacity {
                drop(items);
                warn!(
                    event_id = %item.event.id,
                    event_type = %item.event.event_type,
                    capacity,
                    "retry queue full, rejecting publish"
                );
                item.completion.fail(BusError::RetryQueueFull { capacity });
                return;
            }
        }
        debug!(event_id = %item.event.id, queued = items.len() + 1, "publish queued");
        items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Re-submit every queued item through `publisher`.
    ///
    /// Items are started in insertion order and run concurrently, so their
    /// completion order is not guaranteed. Returns how many were drained.
    pub async fn drain<P: QueuePublisher + ?Sized>(&self, publisher: &P) -> usize {
        let items: Vec<QueuedPublish> = self.items.lock().drain(..).collect();
        let count = items.len();
        if count == 0 {
            return 0;
        }

        debug!(count, "draining retry queue");
        join_all(items.into_iter().map(|item| publisher.publish_queued(item))).await;
        count
    }

    /// Fail every queued item with `error`.
    pub fn fail_all(&self, error: BusError) -> usize {
        let items: Vec<QueuedPublish> = self.items.lock().drain(..).collect();
        let count = items.len();
        for item in items {
            item.completion.fail(error.clone());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct MockPublisher {
        queue: Arc<RetryQueue>,
        accept: AtomicBool,
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl MockPublisher {
        fn new(queue: Arc<RetryQueue>, accept: bool) -> Self {
            Self {
                queue,
                accept: AtomicBool::new(accept),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QueuePublisher for MockPublisher {
        async fn publish_queued(&self, item: QueuedPublish) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(item.event.id.clone());
            if self.accept.load(Ordering::SeqCst) {
                item.completion.succeed();
            } else {
                self.queue.push(item);
            }
        }
    }

    fn event() -> Event {
        Event::new("test", json!({}))
    }

    #[test]
    fn push_increments_length() {
        let queue = RetryQueue::new();
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());

        let (item, _rx) = QueuedPublish::new(event());
        queue.push(item);
        assert_eq!(queue.len(), 1);

        let (item, _rx) = QueuedPublish::new(event());
        queue.push(item);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn drain_publishes_every_item_once() {
        let queue = Arc::new(RetryQueue::new());
        let publisher = MockPublisher::new(queue.clone(), true);

        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (item, rx) = QueuedPublish::new(event());
            ids.push(item.event.id.clone());
            queue.push(item);
            receivers.push(rx);
        }

        assert_eq!(queue.drain(&publisher).await, 3);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*publisher.seen.lock(), ids);
        assert!(queue.is_empty());

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Ok(()));
        }
    }

    #[tokio::test]
    async fn failed_items_go_back_on_the_queue() {
        let queue = Arc::new(RetryQueue::new());
        let publisher = MockPublisher::new(queue.clone(), false);

        let (item, mut rx) = QueuedPublish::new(event());
        queue.push(item);

        queue.drain(&publisher).await;
        assert_eq!(queue.len(), 1);
        assert!(rx.try_recv().is_err());

        publisher.accept.store(true, Ordering::SeqCst);
        queue.drain(&publisher).await;
        assert!(queue.is_empty());
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn drain_of_empty_queue_is_noop() {
        let queue = Arc::new(RetryQueue::new());
        let publisher = MockPublisher::new(queue.clone(), true);
        assert_eq!(queue.drain(&publisher).await, 0);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bounded_queue_rejects_overflow() {
        let queue = RetryQueue::with_capacity(Some(1));
        let (first, _first_rx) = QueuedPublish::new(event());
        let (second, second_rx) = QueuedPublish::new(event());

        queue.push(first);
        queue.push(second);

        assert_eq!(queue.len(), 1);
        assert_eq!(
            second_rx.await.unwrap(),
            Err(BusError::RetryQueueFull { capacity: 1 })
        );
    }

    #[tokio::test]
    async fn fail_all_rejects_pending() {
        let queue = RetryQueue::new();
        let (item, rx) = QueuedPublish::new(event());
        queue.push(item);

        assert_eq!(queue.fail_all(BusError::Destroyed), 1);
        assert!(queue.is_empty());
        assert_eq!(rx.await.unwrap(), Err(BusError::Destroyed));
    }
}
