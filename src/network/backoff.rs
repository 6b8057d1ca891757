//! Retry backoff
//!
//! Doubling delay with a ceiling, reset after every success.

use std::time::Duration;

/// First delay after a transient accept failure
pub const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);

/// Ceiling for accept retries
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// First delay after a failed dial
pub const DIAL_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Ceiling for dial retries
pub const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Exponential backoff state: `initial`, `2 * initial`, ... capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial: initial.min(max),
            max,
            current: None,
        }
    }

    /// Policy for the server accept loop (5ms doubling to 1s)
    pub fn accept() -> Self {
        Self::new(ACCEPT_BACKOFF_INITIAL, ACCEPT_BACKOFF_MAX)
    }

    /// Policy for the client dial loop (1s doubling to 1 minute)
    pub fn dial() -> Self {
        Self::new(DIAL_BACKOFF_INITIAL, DIAL_BACKOFF_MAX)
    }

    /// Advance and return the delay to sleep before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(delay) => delay.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    /// Forget past failures
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Last delay handed out, `None` right after creation or reset
    pub fn current(&self) -> Option<Duration> {
        self.current
    }
}
