//! Worker Module
//!
//! Generic fixed-thread task executor, used to take handler work off the
//! network threads.

mod pool;

pub use pool::{Interceptor, PoolTask, Worker, WorkerPool, WorkerPoolBuilder};
