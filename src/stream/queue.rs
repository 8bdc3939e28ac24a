//! Unbounded FIFO handing received frames from a reader task to a consumer.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::context::DoneSignal;

/// Unbounded FIFO with an async blocking pop.
///
/// `push` never blocks and wakes a waiting consumer. `pop` returns `None`
/// only once the done signal has fired and every buffered item has been
/// taken, so items pushed before teardown are never lost.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    done: DoneSignal,
}

impl<T> BlockingQueue<T> {
    /// Create a queue that ends when `done` fires.
    pub fn new(done: DoneSignal) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            done,
        }
    }

    /// Append an item.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    /// Take the oldest item, waiting for one if the queue is empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
            if self.done.is_fired() {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.done.wait() => {}
            }
        }
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
