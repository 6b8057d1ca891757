//! Thread group
//!
//! Counts the live threads spawned on behalf of one owner so the owner's
//! `close` can block until they have all exited.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Group the current thread was spawned into (0 = none)
    static MEMBER_OF: Cell<u64> = const { Cell::new(0) };
}

pub(crate) struct ThreadGroup {
    id: u64,
    live: Mutex<usize>,
    exited: Condvar,
}

impl ThreadGroup {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            live: Mutex::new(0),
            exited: Condvar::new(),
        })
    }

    /// Spawn a named thread counted by this group
    pub(crate) fn spawn<F>(self: &Arc<Self>, name: String, f: F) -> io::Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        *self.live.lock() += 1;

        let group = Arc::clone(self);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            MEMBER_OF.with(|member| member.set(group.id));
            let _departure = Departure(&group);
            f();
        });

        if spawned.is_err() {
            self.leave();
        }
        spawned
    }

    /// Block until every member thread other than the caller has exited
    pub(crate) fn wait(&self) {
        let own = if self.contains_current() { 1 } else { 0 };
        let mut live = self.live.lock();
        while *live > own {
            self.exited.wait(&mut live);
        }
    }

    /// True if the calling thread belongs to this group
    pub(crate) fn contains_current(&self) -> bool {
        MEMBER_OF.with(|member| member.get() == self.id)
    }

    pub(crate) fn live(&self) -> usize {
        *self.live.lock()
    }

    fn leave(&self) {
        let mut live = self.live.lock();
        *live = live.saturating_sub(1);
        drop(live);
        self.exited.notify_all();
    }
}

/// Decrements the live count when the thread body ends, unwinding included
struct Departure<'a>(&'a ThreadGroup);

impl Drop for Departure<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}
