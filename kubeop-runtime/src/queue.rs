//! A FIFO of pending work with delayed re-enqueueing.
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// An unbounded work queue with many producers and a single consumer
///
/// The queue does not de-duplicate: the same item may be pending several times at once,
/// for example when both a watch event and a scheduled resync enqueue the same key.
/// Consumers must therefore be idempotent and always act on current state rather than
/// on whatever was true when the item was enqueued.
///
/// Cloning produces another handle to the same queue.
pub struct WorkQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
    ready: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            ready: self.ready.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    /// Creates an empty queue
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            ready: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Make `item` available to the consumer immediately
    pub fn enqueue(&self, item: T) {
        // the receiver lives as long as any handle, so sending cannot fail
        if self.tx.send(item).is_ok() {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Wait for the next item
    ///
    /// Returns `None` once `token` is cancelled or the queue is [shut down](Self::shutdown).
    pub async fn dequeue(&self, token: &CancellationToken) -> Option<T> {
        tokio::select! {
            biased;
            () = token.cancelled() => None,
            () = self.shutdown.cancelled() => None,
            item = async { self.rx.lock().await.recv().await } => {
                if item.is_some() {
                    self.ready.fetch_sub(1, Ordering::SeqCst);
                }
                item
            }
        }
    }

    /// The number of items ready to be dequeued
    ///
    /// Items waiting on a delayed [`requeue`](Self::requeue) are not counted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether no item is ready to be dequeued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out items and abandon every pending delayed requeue
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Enqueue `item` again, after `delay` if one is given
    ///
    /// The wait happens on a background task which is abandoned when either `token`
    /// is cancelled or the queue is shut down.
    pub fn requeue(&self, item: T, delay: Option<Duration>, token: &CancellationToken) {
        let Some(delay) = delay.filter(|delay| !delay.is_zero()) else {
            self.enqueue(item);
            return;
        };
        let queue = self.clone();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => queue.enqueue(item),
                () = token.cancelled() => {}
                () = queue.shutdown.cancelled() => {}
            }
        });
    }
}
