//! EventLoop
//!
//! A single-thread task executor. Any thread may submit; exactly one thread
//! runs the loop and executes tasks in submission order.

use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{NetError, Result};
use crate::sync::{panic_message, MonitorQueue, ThreadGroup};

use super::{Ticker, Timer};

/// A deferred unit of work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct LoopShared {
    tasks: MonitorQueue<Task>,
    running: AtomicBool,

    /// Never sent on; dropped by `close` so every receiver disconnects
    closed_tx: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,

    /// Timer and ticker threads, waited on by `close`
    helpers: Arc<ThreadGroup>,
}

/// Handle to a task loop. Cloning yields another handle to the same loop.
///
/// ## States
/// Running → (`close`) → Draining (already-queued tasks still run) → Stopped
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (closed_tx, closed_rx) = channel::bounded(0);
        Self {
            shared: Arc::new(LoopShared {
                tasks: MonitorQueue::unbounded(),
                running: AtomicBool::new(false),
                closed_tx: Mutex::new(Some(closed_tx)),
                closed_rx,
                helpers: ThreadGroup::new(),
            }),
        }
    }

    /// Queue a task for the loop thread. Never blocks.
    ///
    /// Fails with `NetError::Closed` once the loop has been closed; such a task
    /// is dropped without running.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared
            .tasks
            .push(Box::new(task))
            .map_err(|_| NetError::Closed("event loop"))
    }

    /// Run the loop on the calling thread.
    ///
    /// Returns after `close` once every task queued before the close has run.
    pub fn run(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyRunning("event loop"));
        }
        tracing::debug!("event loop started");

        while let Some(batch) = self.shared.tasks.take_all() {
            for task in batch {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                    tracing::error!(
                        panic = %panic_message(&*payload),
                        "event loop task panicked"
                    );
                }
            }
        }

        self.shared.running.store(false, Ordering::Release);
        tracing::debug!("event loop stopped");
        Ok(())
    }

    /// Stop accepting tasks and wake the loop. Idempotent.
    ///
    /// Pending timers and tickers are cancelled; this blocks until their
    /// threads have exited. It does not wait for the thread running the loop,
    /// which returns from `run` once the queue is drained.
    pub fn close(&self) {
        if self.shared.tasks.close() {
            tracing::debug!("event loop closing");
        }
        self.shared.closed_tx.lock().take();
        self.shared.helpers.wait();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.tasks.is_closed()
    }

    /// True while some thread is inside `run`
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of tasks waiting to run
    pub fn pending(&self) -> usize {
        self.shared.tasks.len()
    }

    /// Number of live timer and ticker threads
    pub fn timer_threads(&self) -> usize {
        self.shared.helpers.live()
    }

    /// Disconnects (every `recv` fails) once the loop is closed
    pub(crate) fn closed_signal(&self) -> Receiver<()> {
        self.shared.closed_rx.clone()
    }

    /// Spawn a timer or ticker thread that `close` waits for
    pub(crate) fn spawn_helper<F>(&self, name: &str, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.helpers.spawn(name.to_string(), f).map(drop)
    }

    /// Fire `task` once on this loop after `delay`
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        Timer::start(self.clone(), delay, task)
    }

    /// Fire `task` on this loop every `interval` until stopped
    pub fn schedule_every<F>(&self, interval: Duration, task: F) -> Ticker
    where
        F: FnMut() + Send + 'static,
    {
        Ticker::start(self.clone(), interval, task)
    }

    /// Wrap `f` so that calling the result from any thread runs `f` on this loop
    pub fn wrap<F>(&self, f: F) -> impl Fn() + Send + Sync + 'static
    where
        F: Fn() + Send + Sync + 'static,
    {
        let event_loop = self.clone();
        let f = Arc::new(f);
        move || {
            let f = Arc::clone(&f);
            if event_loop.submit(move || f()).is_err() {
                tracing::trace!("wrapped call dropped: event loop closed");
            }
        }
    }

    /// True if both handles refer to the same loop
    pub fn same_loop(&self, other: &EventLoop) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .field("running", &self.is_running())
            .finish()
    }
}
