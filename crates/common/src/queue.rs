//! Fixed-capacity FIFO shared between the transport loop and the task runner.
//!
//! Neither side ever waits: a push over capacity hands the item back and a pop
//! on an empty queue returns `None`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    // Items are plain data, so a panic in another holder leaves them consistent.
    fn guard(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `item`; returns it back when the queue is already full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut queue = self.guard();
        if queue.len() >= self.capacity {
            return Err(item);
        }
        queue.push_back(item);
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        self.guard().pop_front()
    }

    /// Remove and return every queued item in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        self.guard().drain(..).collect()
    }

    /// Put `items` back ahead of everything queued, keeping their order.
    /// Whatever no longer fits is dropped from the newest end and returned.
    pub fn requeue_front(&self, items: Vec<T>) -> Vec<T> {
        let mut queue = self.guard();
        let mut merged: VecDeque<T> = items.into();
        merged.extend(queue.drain(..));
        let overflow = if merged.len() > self.capacity {
            merged.split_off(self.capacity).into()
        } else {
            Vec::new()
        };
        *queue = merged;
        overflow
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.guard().len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
