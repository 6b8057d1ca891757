//! Loop threads
//!
//! `EventLoopThread` owns the one thread that runs an `EventLoop`;
//! `LoopPool` spreads work over a fixed set of them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{NetError, Result};
use crate::sync::{panic_message, ThreadGroup};

use super::EventLoop;

/// Hook run on the loop thread before the loop starts
pub type LoopInit = Arc<dyn Fn(&EventLoop) + Send + Sync + 'static>;

/// An `EventLoop` together with its dedicated executing thread
pub struct EventLoopThread {
    event_loop: EventLoop,
    thread: Arc<ThreadGroup>,
}

impl EventLoopThread {
    /// Start a loop on a new thread named `name`
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        Self::spawn_with(name, None)
    }

    /// Start a loop on a new thread, running `init` there first
    pub fn spawn_with(name: impl Into<String>, init: Option<LoopInit>) -> Result<Self> {
        let event_loop = EventLoop::new();
        let runner = event_loop.clone();
        let thread = ThreadGroup::new();

        thread.spawn(name.into(), move || {
            if let Some(init) = init {
                let outcome = catch_unwind(AssertUnwindSafe(|| init(&runner)));
                if let Err(payload) = outcome {
                    tracing::error!(panic = %panic_message(&*payload), "event loop init panicked");
                }
            }
            if let Err(e) = runner.run() {
                tracing::error!(error = %e, "event loop thread could not run its loop");
            }
        })?;

        Ok(Self { event_loop, thread })
    }

    /// Handle for submitting work to this thread's loop
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Close the loop, let it drain, and wait for the thread to exit.
    /// Idempotent; every caller waits, however many close concurrently.
    ///
    /// Called from the loop thread itself, this closes without waiting.
    pub fn close(&self) {
        self.event_loop.close();
        self.thread.wait();
    }

    /// True until the loop thread has exited
    pub fn is_alive(&self) -> bool {
        self.thread.live() > 0
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Loop Pool
// =============================================================================

/// A fixed set of loop threads with round-robin or hash selection
pub struct LoopPool {
    threads: Vec<EventLoopThread>,
    next: AtomicUsize,
}

impl LoopPool {
    /// Start `size` loop threads named `{name}-{index}`
    pub fn new(size: usize, name: &str, init: Option<LoopInit>) -> Result<Self> {
        if size == 0 {
            return Err(NetError::Config("loop pool needs at least one loop".to_string()));
        }

        let mut threads = Vec::with_capacity(size);
        for index in 0..size {
            // Already-started threads are closed by Drop if a later spawn fails
            threads.push(EventLoopThread::spawn_with(format!("{name}-{index}"), init.clone())?);
        }

        Ok(Self {
            threads,
            next: AtomicUsize::new(0),
        })
    }

    /// Next loop in round-robin order
    pub fn next_loop(&self) -> EventLoop {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[index].event_loop().clone()
    }

    /// Stable loop choice for a key, so related work stays ordered
    pub fn loop_for_hash(&self, hash: u64) -> EventLoop {
        let index = (hash % self.threads.len() as u64) as usize;
        self.threads[index].event_loop().clone()
    }

    /// Every loop in the pool
    pub fn loops(&self) -> Vec<EventLoop> {
        self.threads.iter().map(|t| t.event_loop().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Close every loop and join every thread
    pub fn close(&self) {
        for thread in &self.threads {
            thread.event_loop().close();
        }
        for thread in &self.threads {
            thread.close();
        }
    }
}
