//! TCP Client
//!
//! Dials one address and serves at most one connection at a time,
//! optionally re-dialing with backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::{ClientConfig, ConnectionConfig};
use crate::error::{NetError, Result};
use crate::protocol::Codec;

use super::dial::Dialer;
use super::{Backoff, Connection, Handler};

struct ClientState {
    connection: Option<Arc<Connection>>,
    /// Thread inside `dial_and_serve`, if any
    runner: Option<ThreadId>,
    closed: bool,
}

struct ClientShared {
    addr: String,
    dial_timeout: Duration,
    connection_config: ConnectionConfig,
    retry: AtomicBool,
    state: Mutex<ClientState>,

    /// Cancelled by `close` to abort a connect in progress
    dialer: Dialer,

    /// Signalled on close and when the dial loop exits
    wake: Condvar,

    span: tracing::Span,
}

/// TCP client handle. Clones share the same client.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let span = tracing::info_span!("client", addr = %config.addr);
        Self {
            shared: Arc::new(ClientShared {
                addr: config.addr,
                dial_timeout: config.dial_timeout,
                connection_config: config.connection,
                retry: AtomicBool::new(config.retry),
                state: Mutex::new(ClientState {
                    connection: None,
                    runner: None,
                    closed: false,
                }),
                dialer: Dialer::new(),
                wake: Condvar::new(),
                span,
            }),
        }
    }

    pub fn enable_retry(&self) {
        self.shared.retry.store(true, Ordering::Release);
    }

    pub fn disable_retry(&self) {
        self.shared.retry.store(false, Ordering::Release);
    }

    pub fn retry_enabled(&self) -> bool {
        self.shared.retry.load(Ordering::Acquire)
    }

    /// Dial and serve on the calling thread.
    ///
    /// - retry disabled: a dial failure is returned; once the connection ends
    ///   the call returns `Ok(())`
    /// - retry enabled: dial failures back off (1s doubling to 1 minute) and
    ///   an ended connection is re-dialed, until `close`
    ///
    /// A `close` during the call ends it with `Ok(())`.
    pub fn dial_and_serve(&self, handler: Arc<dyn Handler>, codec: Arc<dyn Codec>) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(NetError::Closed("client"));
            }
            if state.runner.is_some() {
                return Err(NetError::AlreadyRunning("client"));
            }
            state.runner = Some(thread::current().id());
        }

        let result = {
            let _enter = self.shared.span.enter();
            self.dial_loop(&handler, &codec)
        };

        self.shared.state.lock().runner = None;
        self.shared.wake.notify_all();
        result
    }

    fn dial_loop(&self, handler: &Arc<dyn Handler>, codec: &Arc<dyn Codec>) -> Result<()> {
        let mut backoff = Backoff::dial();

        loop {
            let dialed = self
                .shared
                .dialer
                .connect(&self.shared.addr, self.shared.dial_timeout);
            let stream = match dialed {
                Ok(stream) => stream,
                Err(e) => {
                    if self.is_closed() {
                        return Ok(());
                    }
                    if !self.retry_enabled() {
                        tracing::warn!(error = %e, "dial failed");
                        return Err(e.into());
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, ?delay, "dial failed; retrying");
                    if !self.sleep_unless_closed(delay) {
                        return Ok(());
                    }
                    continue;
                }
            };
            backoff.reset();

            let conn = Connection::new(stream, Arc::clone(codec), &self.shared.connection_config)?;
            if !self.attach(&conn) {
                conn.force_close();
                return Ok(());
            }
            tracing::debug!(conn = %conn.id(), "connected");

            let served = conn.serve(handler);
            self.detach();
            served?;

            if self.is_closed() || !self.retry_enabled() {
                return Ok(());
            }
            tracing::debug!("connection ended; redialing");
        }
    }

    fn attach(&self, conn: &Arc<Connection>) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        state.connection = Some(Arc::clone(conn));
        true
    }

    fn detach(&self) {
        self.shared.state.lock().connection = None;
    }

    /// Sleep for `delay` unless closed first. False if closed.
    fn sleep_unless_closed(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.state.lock();
        while !state.closed {
            if self.shared.wake.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        !state.closed
    }

    /// Stop dialing and force-close the current connection. Idempotent.
    ///
    /// A connect in progress is aborted. Blocks until `dial_and_serve` has
    /// returned, unless called from inside it (a handler callback); every
    /// concurrent caller waits the same way.
    pub fn close(&self) {
        let (first, connection) = {
            let mut state = self.shared.state.lock();
            let first = !state.closed;
            state.closed = true;
            (first, state.connection.take())
        };
        if first {
            self.shared.wake.notify_all();
            self.shared.dialer.cancel();
        }

        if let Some(conn) = connection {
            conn.force_close();
        }

        let current = thread::current().id();
        let mut state = self.shared.state.lock();
        while state.runner.is_some_and(|runner| runner != current) {
            self.shared.wake.wait(&mut state);
        }
        drop(state);

        if first {
            tracing::info!(parent: &self.shared.span, "client closed");
        }
    }

    /// The live connection, `None` between connections or once closed
    pub fn connection(&self) -> Option<Arc<Connection>> {
        let state = self.shared.state.lock();
        if state.closed {
            return None;
        }
        state.connection.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn addr(&self) -> &str {
        &self.shared.addr
    }
}
