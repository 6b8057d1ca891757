//! Timer and Ticker
//!
//! Both are bound to one `EventLoop`: the waiting happens on a small helper
//! thread, the callback itself always runs on the loop thread. Closing the
//! loop cancels both and ends their helper threads.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use super::EventLoop;

// =============================================================================
// Timer
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPhase {
    Armed { deadline: Instant },
    Fired,
    Stopped,
}

struct TimerShared {
    phase: Mutex<TimerPhase>,

    /// Nudges the helper thread after `stop` or `reset`
    changed: Sender<()>,
}

/// One-shot timer. Dropping the handle does not cancel it.
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    pub(crate) fn start<F>(event_loop: EventLoop, delay: Duration, task: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        let (changed_tx, changed_rx) = channel::bounded(1);
        let shared = Arc::new(TimerShared {
            phase: Mutex::new(TimerPhase::Armed {
                deadline: Instant::now() + delay,
            }),
            changed: changed_tx,
        });

        let waiter = Arc::clone(&shared);
        let runner = event_loop.clone();
        let spawned = event_loop.spawn_helper("netloop-timer", move || {
            let closed = runner.closed_signal();
            if waiter.wait_for_deadline(&changed_rx, &closed) && runner.submit(task).is_err() {
                tracing::debug!("timer fired after its event loop closed");
            }
        });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn timer thread");
            *shared.phase.lock() = TimerPhase::Stopped;
        }

        Timer { shared }
    }

    /// Cancel the timer. Returns true if this call prevented the firing.
    pub fn stop(&self) -> bool {
        let mut phase = self.shared.phase.lock();
        match *phase {
            TimerPhase::Armed { .. } => {
                *phase = TimerPhase::Stopped;
                drop(phase);
                self.shared.nudge();
                true
            }
            TimerPhase::Fired | TimerPhase::Stopped => false,
        }
    }

    /// Re-arm a pending timer to fire `delay` from now.
    ///
    /// Returns false (and does nothing) once the timer has fired or stopped.
    pub fn reset(&self, delay: Duration) -> bool {
        let mut phase = self.shared.phase.lock();
        match *phase {
            TimerPhase::Armed { .. } => {
                *phase = TimerPhase::Armed {
                    deadline: Instant::now() + delay,
                };
                drop(phase);
                self.shared.nudge();
                true
            }
            TimerPhase::Fired | TimerPhase::Stopped => false,
        }
    }

    /// True once the callback has been handed to the loop
    pub fn has_fired(&self) -> bool {
        *self.shared.phase.lock() == TimerPhase::Fired
    }
}

impl TimerShared {
    fn nudge(&self) {
        // A full slot already means "look again"
        let _ = self.changed.try_send(());
    }

    /// Wait until the (possibly moved) deadline passes.
    ///
    /// False if the timer was stopped or its loop closed first.
    fn wait_for_deadline(&self, changed: &Receiver<()>, closed: &Receiver<()>) -> bool {
        loop {
            let deadline = {
                let mut phase = self.phase.lock();
                match *phase {
                    TimerPhase::Armed { deadline } => {
                        if Instant::now() >= deadline {
                            *phase = TimerPhase::Fired;
                            return true;
                        }
                        deadline
                    }
                    TimerPhase::Fired | TimerPhase::Stopped => return false,
                }
            };

            crossbeam::select! {
                recv(changed) -> _ => {},
                recv(closed) -> _ => {
                    let mut phase = self.phase.lock();
                    if matches!(*phase, TimerPhase::Armed { .. }) {
                        *phase = TimerPhase::Stopped;
                    }
                    return false;
                },
                recv(channel::at(deadline)) -> _ => {},
            }
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("phase", &*self.shared.phase.lock())
            .finish()
    }
}

// =============================================================================
// Ticker
// =============================================================================

struct TickShared {
    /// Dropped by `stop`, or by the helper when it exits, to mark the ticker
    /// stopped and wake the helper
    stop: Mutex<Option<Sender<()>>>,
}

/// Recurring timer.
///
/// Each tick is submitted to the loop and the next one is not scheduled until
/// it has finished running, so a slow callback throttles the ticker instead of
/// flooding the loop. Ticks that fall behind are skipped, not queued.
/// Dropping the handle does not stop it; it stops on `stop` or when its loop
/// closes.
pub struct Ticker {
    shared: Arc<TickShared>,
}

impl Ticker {
    pub(crate) fn start<F>(event_loop: EventLoop, interval: Duration, task: F) -> Ticker
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded(0);
        let shared = Arc::new(TickShared {
            stop: Mutex::new(Some(stop_tx)),
        });

        let driver = Arc::clone(&shared);
        let runner = event_loop.clone();
        let spawned = event_loop.spawn_helper("netloop-ticker", move || {
            drive(&runner, interval, task, &stop_rx);
            driver.stop.lock().take();
        });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn ticker thread");
            shared.stop.lock().take();
        }

        Ticker { shared }
    }

    /// Stop ticking. Idempotent; a tick already running on the loop completes.
    pub fn stop(&self) {
        self.shared.stop.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.lock().is_none()
    }
}

fn drive<F>(event_loop: &EventLoop, interval: Duration, task: F, stop: &Receiver<()>)
where
    F: FnMut() + Send + 'static,
{
    let closed = event_loop.closed_signal();
    let task = Arc::new(Mutex::new(task));
    let mut next = Instant::now() + interval;

    loop {
        crossbeam::select! {
            recv(stop) -> _ => return,
            recv(closed) -> _ => return,
            recv(channel::at(next)) -> _ => {},
        }

        // The tick drops `done_tx` when it finishes, panicking or not
        let (done_tx, done_rx) = channel::bounded::<()>(0);
        let tick = Arc::clone(&task);
        let submitted = event_loop.submit(move || {
            let _done = done_tx;
            (*tick.lock())();
        });
        if submitted.is_err() {
            tracing::debug!("ticker stopping: event loop closed");
            return;
        }

        crossbeam::select! {
            recv(stop) -> _ => return,
            recv(closed) -> _ => return,
            recv(done_rx) -> _ => {},
        }

        next += interval;
        let now = Instant::now();
        if next <= now {
            next = now + interval;
        }
    }
}

impl fmt::Debug for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticker")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
