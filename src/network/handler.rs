//! Connection handlers
//!
//! Application callbacks invoked by a `Connection`.

use std::sync::Arc;

use bytes::Bytes;

use crate::event_loop::EventLoop;

use super::Connection;

/// Callbacks for one side of a connection.
///
/// For a given connection, `connect(conn, true)` runs exactly once before
/// the first `receive`, `receive` calls never overlap and arrive in wire
/// order, and `connect(conn, false)` runs exactly once after the connection
/// has fully terminated, whatever the cause.
pub trait Handler: Send + Sync + 'static {
    fn connect(&self, conn: &Arc<Connection>, connected: bool) {
        let _ = (conn, connected);
    }

    fn receive(&self, conn: &Arc<Connection>, frame: Bytes) {
        let _ = (conn, frame);
    }
}

/// Handler that ignores every callback
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl Handler for NoopHandler {}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn connect(&self, conn: &Arc<Connection>, connected: bool) {
        (**self).connect(conn, connected)
    }

    fn receive(&self, conn: &Arc<Connection>, frame: Bytes) {
        (**self).receive(conn, frame)
    }
}

/// Runs every callback of `H` on an `EventLoop` instead of the network thread.
///
/// Per-connection ordering is kept because the loop executes in submission
/// order. Callbacks arriving after the loop is closed are dropped.
pub struct LoopHandler<H> {
    event_loop: EventLoop,
    inner: Arc<H>,
}

impl<H: Handler> LoopHandler<H> {
    pub fn new(event_loop: EventLoop, inner: H) -> Self {
        Self {
            event_loop,
            inner: Arc::new(inner),
        }
    }

    pub fn inner(&self) -> &Arc<H> {
        &self.inner
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }
}

impl<H: Handler> Handler for LoopHandler<H> {
    fn connect(&self, conn: &Arc<Connection>, connected: bool) {
        let id = conn.id();
        let inner = Arc::clone(&self.inner);
        let conn = Arc::clone(conn);
        if self
            .event_loop
            .submit(move || inner.connect(&conn, connected))
            .is_err()
        {
            tracing::debug!(conn = %id, connected, "connect callback dropped: event loop closed");
        }
    }

    fn receive(&self, conn: &Arc<Connection>, frame: Bytes) {
        let id = conn.id();
        let inner = Arc::clone(&self.inner);
        let conn = Arc::clone(conn);
        if self
            .event_loop
            .submit(move || inner.receive(&conn, frame))
            .is_err()
        {
            tracing::debug!(conn = %id, "receive callback dropped: event loop closed");
        }
    }
}
