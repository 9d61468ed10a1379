//! Bounded FIFO queue, the building block for the rate limiter and the
//! per-connection outbound buffer.

use std::collections::VecDeque;
use thiserror::Error;

/// Errors raised by strict [`Queue`] operations. The non-strict variants
/// (`offer`, `poll`, `peek`) never produce these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapacityError {
    #[error("queue is full (capacity {0})")]
    Full(usize),

    #[error("queue is empty")]
    Empty,
}

/// A strict-FIFO queue with a fixed capacity. No random access; elements
/// leave in exactly the order they entered.
#[derive(Debug)]
pub struct Queue<T> {
    items: VecDeque<T>,
    max_size: usize,
}

impl<T> Queue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(max_size.min(64)),
            max_size,
        }
    }

    /// Appends to the tail, failing with [`CapacityError::Full`] at capacity.
    pub fn add(&mut self, item: T) -> Result<(), CapacityError> {
        if self.items.len() >= self.max_size {
            return Err(CapacityError::Full(self.max_size));
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Appends to the tail, returning `false` instead of failing at capacity.
    pub fn offer(&mut self, item: T) -> bool {
        self.add(item).is_ok()
    }

    /// Pops the head, failing with [`CapacityError::Empty`] when empty.
    pub fn remove(&mut self) -> Result<T, CapacityError> {
        self.items.pop_front().ok_or(CapacityError::Empty)
    }

    /// Pops the head, or `None` when empty.
    pub fn poll(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Non-destructive read of the head.
    pub fn element(&self) -> Result<&T, CapacityError> {
        self.items.front().ok_or(CapacityError::Empty)
    }

    /// Non-destructive read of the tail.
    pub fn element_last(&self) -> Result<&T, CapacityError> {
        self.items.back().ok_or(CapacityError::Empty)
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn peek_last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
