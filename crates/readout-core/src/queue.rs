//! Bounded single-producer/single-consumer FIFO.
//!
//! Every hop of the data path (equipment → aggregator, aggregator →
//! consumers) goes through a [`BoundedQueue`]. The queue never grows: a
//! producer observing `is_full()` must back off and report `Idle` instead
//! of blocking, so queue contention can never stall DMA progress.
//!
//! Backed by `crossbeam_queue::ArrayQueue`, which is multi-producer
//! multi-consumer; the SPSC discipline is a usage contract of the data
//! path, not a type-level restriction.

use crossbeam_queue::ArrayQueue;

pub struct BoundedQueue<T> {
    inner: ArrayQueue<T>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0 (rejected earlier by config validation).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Push an item; on a full queue the item is handed back to the caller.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.inner.push(item)
    }

    /// Pop the oldest item, `None` when empty.
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Drop all queued items.
    ///
    /// Items holding pool pages release them through their `Drop` impls.
    pub fn clear(&self) {
        while self.inner.pop().is_some() {}
    }
}
