//! Bounded per-session live-event queue. When full, the oldest queued event
//! is evicted so the newest results always get through.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug)]
pub struct LiveQueue<T> {
    events: Mutex<VecDeque<T>>,
    capacity: usize,
    ready: Notify,
}

impl<T> LiveQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue an item. Returns the evicted item, if any.
    pub fn push(&self, envelope: T) -> Option<T> {
        let evicted = {
            let mut guard = self.lock();
            let evicted = if guard.len() >= self.capacity {
                guard.pop_front()
            } else {
                None
            };
            guard.push_back(envelope);
            evicted
        };
        self.ready.notify_one();
        evicted
    }

    /// Remove everything queued. Returns how many items were discarded.
    pub fn clear(&self) -> usize {
        let mut guard = self.lock();
        let n = guard.len();
        guard.clear();
        n
    }

    /// Wait for the next item.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(v) = self.lock().pop_front() {
                return v;
            }
            self.ready.notified().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        match self.events.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
