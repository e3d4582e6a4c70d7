//! Bounded single-consumer queue that never blocks the producer.
//!
//! When the queue is full the oldest item is discarded to make room and the
//! drop is counted. Closing the queue lets the consumer drain what is left,
//! after which `pop` returns `None`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Outcome of a [`DropOldestQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// The oldest item was discarded; `first` is set on the first drop of a
    /// burst, i.e. since the consumer last made room.
    Overflow { first: bool },
    /// The queue is closed and the item was discarded
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    overflowing: bool,
}

pub struct DropOldestQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        DropOldestQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
                overflowing: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: T) -> Pushed {
        let pushed = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Pushed::Closed;
            }
            let pushed = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let first = !inner.overflowing;
                inner.overflowing = true;
                Pushed::Overflow { first }
            } else {
                Pushed::Queued
            };
            inner.items.push_back(item);
            pushed
        };
        self.notify.notify_one();
        pushed
    }

    /// Wait for the next item. Returns `None` once closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(item) = inner.items.pop_front() {
                    inner.overflowing = false;
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.items.pop_front();
        if item.is_some() {
            inner.overflowing = false;
        }
        item
    }

    /// Stop accepting items. Items already queued are still delivered.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items discarded by overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
