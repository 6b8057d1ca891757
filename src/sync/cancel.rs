//! Cancellation token

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Listener = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    next_listener: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

/// A clonable, one-way cancellation flag.
///
/// Every clone observes the same flag; once cancelled it stays cancelled.
/// Threads blocked on the token's behalf are woken by `cancel` itself.
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and run every registered wake-up. Idempotent.
    pub fn cancel(&self) {
        let listeners = {
            let mut listeners = self.state.listeners.lock();
            if self.state.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *listeners)
        };
        for (_, wake) in listeners {
            wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Run `wake` once when the token is cancelled, unless the returned guard
    /// is dropped first. Runs nothing if the token is already cancelled; the
    /// caller checks `is_cancelled` after registering.
    pub(crate) fn on_cancel<F>(&self, wake: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.state.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.state.listeners.lock();
        if !self.state.cancelled.load(Ordering::Acquire) {
            listeners.push((id, Box::new(wake)));
        }
        CancelRegistration {
            state: Arc::clone(&self.state),
            id,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Removes its wake-up from the token when dropped
pub(crate) struct CancelRegistration {
    state: Arc<TokenState>,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        self.state.listeners.lock().retain(|(id, _)| *id != self.id);
    }
}
