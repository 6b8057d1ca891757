//! Monitor Queue
//!
//! A FIFO guarded by one mutex and two condition variables. This is the single
//! hand-off primitive behind the connection send queue, the event loop task
//! queue and the worker pool mailbox.
//!
//! ## Close contract
//! - `close` stops accepting new items (pushes hand the item back)
//! - items already queued are still delivered to consumers
//! - consumers only observe exhaustion (`None`) once closed AND empty

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::CancelToken;

/// Why a push was refused. The rejected item is handed back.
pub enum PushError<T> {
    /// The queue was closed
    Closed(T),

    /// The queue is bounded and full (non-blocking push only)
    Full(T),

    /// The cancellation token fired while waiting for room
    Cancelled(T),
}

impl<T> PushError<T> {
    /// Recover the item that was not queued
    pub fn into_inner(self) -> T {
        match self {
            PushError::Closed(item) | PushError::Full(item) | PushError::Cancelled(item) => item,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PushError::Closed(_))
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Closed(_) => f.write_str("Closed(..)"),
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Cancelled(_) => f.write_str("Cancelled(..)"),
        }
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Monitor<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// Mutex + wait/notify FIFO with an optional capacity bound
pub struct MonitorQueue<T> {
    monitor: Arc<Monitor<T>>,
    capacity: Option<usize>,
}

impl<T> MonitorQueue<T> {
    /// Create a queue that never blocks producers
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            monitor: Arc::new(Monitor {
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
            capacity,
        }
    }

    // =========================================================================
    // Producers
    // =========================================================================

    /// Append an item, blocking while the queue is full
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.monitor.state.lock();
        while !state.closed && self.is_full(&state) {
            self.monitor.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(PushError::Closed(item));
        }
        state.items.push_back(item);
        drop(state);

        self.monitor.not_empty.notify_one();
        Ok(())
    }

    /// Append an item without ever blocking
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.monitor.state.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        if self.is_full(&state) {
            return Err(PushError::Full(item));
        }
        state.items.push_back(item);
        drop(state);

        self.monitor.not_empty.notify_one();
        Ok(())
    }

    // =========================================================================
    // Consumers
    // =========================================================================

    /// Take the oldest item, blocking while empty.
    ///
    /// Returns `None` only when the queue is closed and fully drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.monitor.state.lock();
        while !state.closed && state.items.is_empty() {
            self.monitor.not_empty.wait(&mut state);
        }
        let item = state.items.pop_front();
        drop(state);

        if item.is_some() && self.capacity.is_some() {
            self.monitor.not_full.notify_one();
        }
        item
    }

    /// Swap out the entire pending batch, blocking while empty.
    ///
    /// The batch is processed by the caller after the lock is released.
    /// Returns `None` only when the queue is closed and fully drained.
    pub fn take_all(&self) -> Option<VecDeque<T>> {
        let mut state = self.monitor.state.lock();
        while !state.closed && state.items.is_empty() {
            self.monitor.not_empty.wait(&mut state);
        }
        if state.items.is_empty() {
            return None;
        }
        let batch = std::mem::take(&mut state.items);
        drop(state);

        if self.capacity.is_some() {
            self.monitor.not_full.notify_all();
        }
        Some(batch)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop accepting items and wake every parked producer and consumer.
    ///
    /// Returns true only for the call that actually closed the queue.
    pub fn close(&self) -> bool {
        let mut state = self.monitor.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        drop(state);

        self.monitor.not_empty.notify_all();
        self.monitor.not_full.notify_all();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.monitor.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.monitor.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitor.state.lock().items.is_empty()
    }

    /// Capacity bound, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn is_full(&self, state: &QueueState<T>) -> bool {
        match self.capacity {
            Some(cap) => state.items.len() >= cap,
            None => false,
        }
    }
}

impl<T: Send + 'static> MonitorQueue<T> {
    /// Like `push`, but gives up once `cancel` fires
    pub fn push_until(&self, item: T, cancel: &CancelToken) -> Result<(), PushError<T>> {
        let monitor = Arc::downgrade(&self.monitor);
        let _registration = cancel.on_cancel(move || {
            if let Some(monitor) = monitor.upgrade() {
                // Holding the lock orders the wake-up after the waiter parks
                let _state = monitor.state.lock();
                monitor.not_full.notify_all();
            }
        });

        let mut state = self.monitor.state.lock();
        while !state.closed && self.is_full(&state) {
            if cancel.is_cancelled() {
                return Err(PushError::Cancelled(item));
            }
            self.monitor.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(PushError::Closed(item));
        }
        state.items.push_back(item);
        drop(state);

        self.monitor.not_empty.notify_one();
        Ok(())
    }
}

impl<T> Default for MonitorQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> fmt::Debug for MonitorQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.monitor.state.lock();
        f.debug_struct("MonitorQueue")
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .field("capacity", &self.capacity)
            .finish()
    }
}
