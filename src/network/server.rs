//! TCP Server
//!
//! Accepts connections and runs each one on its own thread.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use socket2::SockRef;

use crate::config::ServerConfig;
use crate::error::{NetError, Result};
use crate::protocol::Codec;
use crate::sync::ThreadGroup;

use super::{Backoff, Connection, ConnectionId, Handler};

struct ServerState {
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    connections: HashMap<ConnectionId, Arc<Connection>>,
    serving: bool,
    closed: bool,
}

struct ServerShared {
    config: ServerConfig,
    state: Mutex<ServerState>,

    /// Signalled on close so backoff sleeps end early
    wake: Condvar,

    /// Connection threads, waited on by `close`
    threads: Arc<ThreadGroup>,

    span: tracing::Span,
}

/// TCP server handle. Clones share the same server.
///
/// Every accepted connection is registered before its thread starts and
/// removed when that thread ends.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Create a new server with the given config
    pub fn new(config: ServerConfig) -> Self {
        let span = tracing::info_span!("server", addr = %config.bind_addr());
        Self {
            shared: Arc::new(ServerShared {
                config,
                state: Mutex::new(ServerState {
                    listener: None,
                    local_addr: None,
                    connections: HashMap::new(),
                    serving: false,
                    closed: false,
                }),
                wake: Condvar::new(),
                threads: ThreadGroup::new(),
                span,
            }),
        }
    }

    /// Bind the listening socket and return its address.
    ///
    /// Calling it again returns the existing address.
    pub fn listen(&self) -> Result<SocketAddr> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(NetError::Closed("server"));
        }
        if let Some(addr) = state.local_addr {
            return Ok(addr);
        }

        let listener = TcpListener::bind(self.shared.config.bind_addr())?;
        let addr = listener.local_addr()?;
        state.listener = Some(listener);
        state.local_addr = Some(addr);

        tracing::info!(parent: &self.shared.span, %addr, "listening");
        Ok(addr)
    }

    /// `listen` followed by `serve`
    pub fn listen_and_serve(&self, handler: Arc<dyn Handler>, codec: Arc<dyn Codec>) -> Result<()> {
        self.listen()?;
        self.serve(handler, codec)
    }

    /// Run the accept loop on the calling thread.
    ///
    /// Returns `Ok(())` once `close` stops the loop, or the accept error that
    /// ended it. Transient accept errors are retried with backoff.
    pub fn serve(&self, handler: Arc<dyn Handler>, codec: Arc<dyn Codec>) -> Result<()> {
        let listener = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(NetError::Closed("server"));
            }
            if state.serving {
                return Err(NetError::AlreadyRunning("server"));
            }
            let listener = state
                .listener
                .as_ref()
                .ok_or(NetError::NotListening)?
                .try_clone()?;
            state.serving = true;
            listener
        };

        let _enter = self.shared.span.enter();
        let result = self.accept_loop(&listener, &handler, &codec);
        self.shared.state.lock().serving = false;
        result
    }

    fn accept_loop(
        &self,
        listener: &TcpListener,
        handler: &Arc<dyn Handler>,
        codec: &Arc<dyn Codec>,
    ) -> Result<()> {
        let mut backoff = Backoff::accept();

        loop {
            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) => {
                    if self.is_closed() {
                        tracing::debug!("accept loop stopped");
                        return Ok(());
                    }
                    if is_transient_accept_error(&e) {
                        let delay = backoff.next_delay();
                        tracing::warn!(error = %e, ?delay, "accept error; retrying");
                        if !self.sleep_unless_closed(delay) {
                            return Ok(());
                        }
                        continue;
                    }
                    tracing::error!(error = %e, "accept failed");
                    return Err(e.into());
                }
            };
            backoff.reset();

            if self.is_closed() {
                return Ok(());
            }

            let conn = match Connection::new(stream, Arc::clone(codec), &self.shared.config.connection) {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to set up accepted connection");
                    continue;
                }
            };

            match self.start_connection(&conn, handler) {
                Ok(true) => {}
                Ok(false) => {
                    conn.force_close();
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(conn = %conn.id(), error = %e, "failed to spawn connection thread");
                    conn.force_close();
                }
            }
        }
    }

    fn spawn_connection(&self, conn: Arc<Connection>, handler: Arc<dyn Handler>) -> io::Result<()> {
        let server = self.clone();
        let span = self.shared.span.clone();
        let name = format!("netloop-conn-{}", conn.id());

        self.shared.threads.spawn(name, move || {
            let _enter = span.enter();
            if let Err(e) = conn.serve(&handler) {
                tracing::warn!(conn = %conn.id(), error = %e, "connection did not start");
            }
            server.untrack(conn.id());
        })?;
        Ok(())
    }

    /// Register the connection and start its thread under one lock, so that
    /// `close` sees both or neither. False if the server is already closed.
    fn start_connection(&self, conn: &Arc<Connection>, handler: &Arc<dyn Handler>) -> io::Result<bool> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Ok(false);
        }
        self.spawn_connection(Arc::clone(conn), Arc::clone(handler))?;
        state.connections.insert(conn.id(), Arc::clone(conn));
        Ok(true)
    }

    fn untrack(&self, id: ConnectionId) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.connections.remove(&id);
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

    /// Hard stop: close the listener, force-close every connection, and wait
    /// for their threads to exit. Idempotent; a concurrent second call waits
    /// for the same threads instead of returning early.
    ///
    /// Does not wait for the connection thread it is called from, if any.
    pub fn close(&self) {
        let teardown = {
            let mut state = self.shared.state.lock();
            if state.closed {
                None
            } else {
                state.closed = true;
                Some((state.listener.take(), std::mem::take(&mut state.connections)))
            }
        };

        let Some((listener, connections)) = teardown else {
            self.shared.threads.wait();
            return;
        };
        self.shared.wake.notify_all();

        if let Some(listener) = listener {
            wake_accept(&listener);
        }
        for conn in connections.values() {
            conn.force_close();
        }

        tracing::debug!(
            parent: &self.shared.span,
            connections = connections.len(),
            threads = self.shared.threads.live(),
            "waiting for connection threads"
        );
        self.shared.threads.wait();
        tracing::info!(parent: &self.shared.span, "server closed");
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Bound address, once `listen` has succeeded
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().local_addr
    }

    /// Number of tracked live connections
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    /// Snapshot of the tracked live connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.state.lock().connections.values().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

/// Accept errors worth retrying: resource exhaustion and aborted handshakes
pub(super) fn is_transient_accept_error(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        _ => is_resource_exhaustion(e),
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    // ENOMEM, ENFILE, EMFILE share these values on Linux and the BSDs
    matches!(e.raw_os_error(), Some(12) | Some(23) | Some(24))
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_e: &io::Error) -> bool {
    false
}

/// Unblock a thread parked in `accept` on this listener
pub(super) fn wake_accept(listener: &TcpListener) {
    if SockRef::from(listener).shutdown(Shutdown::Both).is_ok() {
        return;
    }

    // Platforms that refuse shutdown on a listener: poke it with a connection
    let Ok(mut addr) = listener.local_addr() else {
        return;
    };
    if addr.ip().is_unspecified() {
        let loopback = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        addr.set_ip(loopback);
    }
    let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(200));
}
