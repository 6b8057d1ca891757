//! Worker Pool
//!
//! Fixed worker threads pulling from one shared mailbox.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crate::error::{NetError, Result};
use crate::sync::{panic_message, CancelToken, MonitorQueue, PushError, ThreadGroup};

/// A unit of work executed by some worker
pub type PoolTask = Box<dyn FnOnce(&mut Worker) + Send + 'static>;

/// Wraps a worker's whole processing loop, once, at worker start.
///
/// Receives the worker and the loop; it is expected to set up worker-local
/// state and then call the loop. If it returns without calling it, the loop
/// runs afterwards anyway so queued tasks are never stranded.
pub type Interceptor = Arc<dyn Fn(&mut Worker, &mut dyn FnMut(&mut Worker)) + Send + Sync + 'static>;

/// Per-thread context handed to every task
pub struct Worker {
    index: usize,
    state: Option<Box<dyn Any + Send>>,
}

impl Worker {
    /// Position of this worker in the pool, `0..worker_count`
    pub fn index(&self) -> usize {
        self.index
    }

    /// Attach worker-local state, replacing any previous value
    pub fn set_state<T: Any + Send>(&mut self, value: T) {
        self.state = Some(Box::new(value));
    }

    pub fn state<T: Any>(&self) -> Option<&T> {
        self.state.as_deref()?.downcast_ref::<T>()
    }

    pub fn state_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.state.as_deref_mut()?.downcast_mut::<T>()
    }

    pub fn take_state(&mut self) -> Option<Box<dyn Any + Send>> {
        self.state.take()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for WorkerPool
pub struct WorkerPoolBuilder {
    workers: usize,
    capacity: Option<usize>,
    name: String,
    interceptor: Option<Interceptor>,
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            capacity: None,
            name: "netloop-worker".to_string(),
            interceptor: None,
        }
    }
}

impl WorkerPoolBuilder {
    /// Set the number of worker threads
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    /// Bound the mailbox; `None` or `Some(0)` means unbounded
    pub fn capacity(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity.filter(|&cap| cap > 0);
        self
    }

    /// Thread name prefix
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Wrap each worker's processing loop
    pub fn interceptor<F>(mut self, interceptor: F) -> Self
    where
        F: Fn(&mut Worker, &mut dyn FnMut(&mut Worker)) + Send + Sync + 'static,
    {
        self.interceptor = Some(Arc::new(interceptor));
        self
    }

    /// Start the workers
    pub fn build(self) -> Result<WorkerPool> {
        if self.workers == 0 {
            return Err(NetError::Config("worker pool needs at least one worker".to_string()));
        }

        let mailbox = Arc::new(match self.capacity {
            Some(cap) => MonitorQueue::bounded(cap),
            None => MonitorQueue::unbounded(),
        });

        let pool = WorkerPool {
            mailbox,
            workers: ThreadGroup::new(),
            worker_count: self.workers,
        };

        for index in 0..self.workers {
            let mailbox = Arc::clone(&pool.mailbox);
            let interceptor = self.interceptor.clone();
            let spawned = pool.workers.spawn(format!("{}-{}", self.name, index), move || {
                worker_main(index, &mailbox, interceptor.as_deref())
            });

            if let Err(e) = spawned {
                // Dropping the pool closes and waits for what already started
                tracing::error!(error = %e, "failed to spawn worker thread");
                return Err(e.into());
            }
        }

        tracing::debug!(workers = self.workers, capacity = ?self.capacity, "worker pool started");
        Ok(pool)
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Fixed-size thread pool.
///
/// `close` stops new submissions and returns only after every accepted task
/// has run exactly once and every worker has exited.
pub struct WorkerPool {
    mailbox: Arc<MonitorQueue<PoolTask>>,
    workers: Arc<ThreadGroup>,
    worker_count: usize,
}

impl WorkerPool {
    /// Create a new pool builder
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::default()
    }

    /// Submit a task, blocking while a bounded mailbox is full
    pub fn run<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut Worker) + Send + 'static,
    {
        self.mailbox
            .push(Box::new(task))
            .map_err(|_| NetError::Closed("worker pool"))
    }

    /// Like `run`, but gives up with `NetError::Cancelled` once `cancel` fires
    pub fn run_cancellable<F>(&self, task: F, cancel: &CancelToken) -> Result<()>
    where
        F: FnOnce(&mut Worker) + Send + 'static,
    {
        self.mailbox
            .push_until(Box::new(task), cancel)
            .map_err(submit_error)
    }

    /// Submit without blocking; `NetError::Full` if the mailbox is full
    pub fn try_run<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut Worker) + Send + 'static,
    {
        self.mailbox.try_push(Box::new(task)).map_err(submit_error)
    }

    /// Stop accepting tasks, run everything already queued, and wait for the
    /// workers to exit. Idempotent; concurrent callers all wait.
    ///
    /// Called from a worker thread, it does not wait for that worker.
    pub fn close(&self) {
        if self.mailbox.close() {
            tracing::debug!(workers = self.worker_count, "worker pool closing");
        }
        self.workers.wait();
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// Tasks waiting in the mailbox
    pub fn len(&self) -> usize {
        self.mailbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailbox.is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn submit_error(error: PushError<PoolTask>) -> NetError {
    match error {
        PushError::Closed(_) => NetError::Closed("worker pool"),
        PushError::Full(_) => NetError::Full,
        PushError::Cancelled(_) => NetError::Cancelled,
    }
}

fn worker_main(
    index: usize,
    mailbox: &MonitorQueue<PoolTask>,
    interceptor: Option<&(dyn Fn(&mut Worker, &mut dyn FnMut(&mut Worker)) + Send + Sync)>,
) {
    let mut worker = Worker { index, state: None };
    let mut drained = false;

    if let Some(interceptor) = interceptor {
        let mut run = |worker: &mut Worker| {
            if !drained {
                drained = true;
                process(mailbox, worker);
            }
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| interceptor(&mut worker, &mut run)));
        if let Err(payload) = outcome {
            tracing::error!(worker = index, panic = %panic_message(&*payload), "worker interceptor panicked");
        }
    }

    if !drained {
        process(mailbox, &mut worker);
    }
}

fn process(mailbox: &MonitorQueue<PoolTask>, worker: &mut Worker) {
    while let Some(task) = mailbox.pop() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task(worker))) {
            tracing::error!(
                worker = worker.index,
                panic = %panic_message(&*payload),
                "worker task panicked"
            );
        }
    }
}
