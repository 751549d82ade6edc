//! Bounded blocking queue
//!
//! The boundary between blocking producers (capture threads, pipeline
//! submitters) and the pump threads that drain them. `push` blocks up to a
//! deadline and reports `InputFull` past it, so a stalled consumer surfaces
//! as backpressure instead of unbounded memory growth.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{Result, StreamError};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue an item, waiting up to `timeout` for space.
    pub fn push(&self, item: T, timeout: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        while inner.items.len() >= self.capacity && !inner.closed {
            if self.not_full.wait_for(&mut inner, timeout).timed_out() {
                return Err(StreamError::InputFull);
            }
        }
        if inner.closed {
            return Err(StreamError::Fail("queue closed".to_string()));
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue an item, waiting up to `timeout`. `None` on timeout or when
    /// the queue is closed and drained.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            if self.not_empty.wait_for(&mut inner, timeout).timed_out() {
                return None;
            }
        }
    }

    /// Close the queue: pending items remain poppable, new pushes fail and
    /// blocked poppers wake up once the queue drains.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Drop all pending items.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        self.not_full.notify_all();
    }
}
