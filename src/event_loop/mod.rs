//! Event Loop Module
//!
//! Serializes callbacks onto one thread.
//!
//! ## Architecture
//! ```text
//!   any thread ── submit ──► MonitorQueue<Task> ──► loop thread
//!                                  ▲                (batch swap, run in order)
//!   Timer / Ticker helper ─────────┘
//! ```

mod executor;
mod thread;
mod timer;

pub use executor::{EventLoop, Task};
pub use thread::{EventLoopThread, LoopInit, LoopPool};
pub use timer::{Ticker, Timer};
