//! Bounded handoff queue.
//!
//! Fixed-capacity circular buffer with blocking `put`/`get`, used to park
//! accepted connections while every worker is busy and the pool is at its
//! cap.
//!
//! # Invariants
//! - `0 <= len <= capacity`.
//! - The element at logical index `i` lives at `(head + i) % capacity`.
//! - Slots outside `[head, head + len)` hold `None`.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Ring<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    fn push_back(&mut self, item: T) {
        debug_assert!(!self.is_full());
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(item);
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        item
    }
}

/// Blocking FIFO with a fixed capacity.
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedQueue capacity must be > 0");
        let slots = (0..capacity).map(|_| None).collect();
        Self {
            ring: Mutex::new(Ring {
                slots,
                head: 0,
                len: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        // Ring bookkeeping is updated atomically under the lock, so a
        // poisoned guard still holds a consistent ring.
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append, blocking while the queue is full.
    pub fn put(&self, item: T) {
        let mut ring = self.lock();
        while ring.is_full() {
            ring = self
                .not_full
                .wait(ring)
                .unwrap_or_else(PoisonError::into_inner);
        }
        ring.push_back(item);
        drop(ring);
        self.not_empty.notify_one();
    }

    /// Append, waiting at most `timeout` for space. Hands the item back on
    /// timeout.
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.lock();
        while ring.is_full() {
            let now = Instant::now();
            if now >= deadline {
                return Err(item);
            }
            ring = self
                .not_full
                .wait_timeout(ring, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        ring.push_back(item);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append without waiting. Hands the item back if the queue is full.
    pub fn try_put(&self, item: T) -> Result<(), T> {
        let mut ring = self.lock();
        if ring.is_full() {
            return Err(item);
        }
        ring.push_back(item);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking while the queue is empty.
    pub fn get(&self) -> T {
        let mut ring = self.lock();
        loop {
            if let Some(item) = ring.pop_front() {
                drop(ring);
                self.not_full.notify_one();
                return item;
            }
            ring = self
                .not_empty
                .wait(ring)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Remove the oldest item, waiting at most `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.lock();
        loop {
            if let Some(item) = ring.pop_front() {
                drop(ring);
                self.not_full.notify_one();
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            ring = self
                .not_empty
                .wait_timeout(ring, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Remove the oldest item without waiting.
    pub fn try_get(&self) -> Option<T> {
        let item = self.lock().pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }
}
