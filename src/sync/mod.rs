//! Synchronization Module
//!
//! Blocking hand-off primitives shared by the event loop, connections and
//! the worker pool.
//!
//! ## Components
//! - `MonitorQueue`: mutex + condvar FIFO with a single close contract
//! - `CancelToken`: external cancellation for blocking submits
//! - `CountDownLatch`: wait for N events

mod cancel;
mod group;
mod latch;
mod monitor;

pub use cancel::CancelToken;
pub use latch::CountDownLatch;
pub use monitor::{MonitorQueue, PushError};

pub(crate) use group::ThreadGroup;

use std::any::Any;

/// Render a caught panic payload for logging
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
