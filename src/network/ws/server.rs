//! WebSocket Server
//!
//! Accepts TCP connections, upgrades each on its own thread and serves it
//! there.

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::ServerConfig;
use crate::error::{NetError, Result};
use crate::network::server::{is_transient_accept_error, wake_accept};
use crate::network::{Backoff, ConnectionId};
use crate::sync::ThreadGroup;

use super::{WsConnection, WsHandler};

struct WsServerState {
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,

    /// Sockets still in the upgrade handshake
    upgrading: HashMap<ConnectionId, TcpStream>,
    connections: HashMap<ConnectionId, Arc<WsConnection>>,
    serving: bool,
    closed: bool,
}

struct WsServerShared {
    config: ServerConfig,
    state: Mutex<WsServerState>,
    wake: Condvar,
    threads: Arc<ThreadGroup>,
    span: tracing::Span,
}

/// WebSocket server handle. Clones share the same server.
///
/// Lifecycle and close semantics match `Server`; a socket that is still
/// upgrading when the server closes is shut down as well.
#[derive(Clone)]
pub struct WsServer {
    shared: Arc<WsServerShared>,
}

impl WsServer {
    pub fn new(config: ServerConfig) -> Self {
        let span = tracing::info_span!("ws_server", addr = %config.bind_addr());
        Self {
            shared: Arc::new(WsServerShared {
                config,
                state: Mutex::new(WsServerState {
                    listener: None,
                    local_addr: None,
                    upgrading: HashMap::new(),
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

    /// Bind the listening socket and return its address
    pub fn listen(&self) -> Result<SocketAddr> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(NetError::Closed("websocket server"));
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

    pub fn listen_and_serve(&self, handler: Arc<dyn WsHandler>) -> Result<()> {
        self.listen()?;
        self.serve(handler)
    }

    /// Run the accept loop on the calling thread until `close`
    pub fn serve(&self, handler: Arc<dyn WsHandler>) -> Result<()> {
        let listener = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(NetError::Closed("websocket server"));
            }
            if state.serving {
                return Err(NetError::AlreadyRunning("websocket server"));
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
        let result = self.accept_loop(&listener, &handler);
        self.shared.state.lock().serving = false;
        result
    }

    fn accept_loop(&self, listener: &TcpListener, handler: &Arc<dyn WsHandler>) -> Result<()> {
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

            match self.start_upgrade(stream, handler) {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) => tracing::warn!(error = %e, "failed to spawn websocket thread"),
            }
        }
    }

    /// Register the socket as upgrading and start its thread under one lock.
    /// False if the server is already closed.
    fn start_upgrade(&self, stream: TcpStream, handler: &Arc<dyn WsHandler>) -> io::Result<bool> {
        let id = ConnectionId::next();
        let mut state = self.shared.state.lock();
        if state.closed {
            return Ok(false);
        }

        let pending = stream.try_clone()?;
        let server = self.clone();
        let handler = Arc::clone(handler);
        let span = self.shared.span.clone();
        self.shared.threads.spawn(format!("netloop-ws-{id}"), move || {
            let _enter = span.enter();
            server.run_connection(id, stream, &handler);
        })?;
        state.upgrading.insert(id, pending);
        Ok(true)
    }

    fn run_connection(&self, id: ConnectionId, stream: TcpStream, handler: &Arc<dyn WsHandler>) {
        let config = &self.shared.config;
        let upgraded = WsConnection::accept(id, stream, &config.connection, config.handshake_timeout);

        let closed = {
            let mut state = self.shared.state.lock();
            state.upgrading.remove(&id);
            if let (Ok(conn), false) = (&upgraded, state.closed) {
                state.connections.insert(id, Arc::clone(conn));
            }
            state.closed
        };

        match upgraded {
            Ok(conn) if closed => conn.force_close(),
            Ok(conn) => {
                if let Err(e) = conn.serve(handler) {
                    tracing::warn!(id = id.as_u64(), error = %e, "websocket connection did not start");
                }
                self.untrack(id);
            }
            Err(_) if closed => {}
            Err(e) => tracing::debug!(id = id.as_u64(), error = %e, "websocket upgrade failed"),
        }
    }

    fn untrack(&self, id: ConnectionId) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.connections.remove(&id);
    }

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

    /// Hard stop: close the listener, abort every upgrading socket and
    /// connection, and wait for their threads. Idempotent; concurrent
    /// callers all wait.
    pub fn close(&self) {
        let teardown = {
            let mut state = self.shared.state.lock();
            if state.closed {
                None
            } else {
                state.closed = true;
                Some((
                    state.listener.take(),
                    std::mem::take(&mut state.upgrading),
                    std::mem::take(&mut state.connections),
                ))
            }
        };

        let Some((listener, upgrading, connections)) = teardown else {
            self.shared.threads.wait();
            return;
        };
        self.shared.wake.notify_all();

        if let Some(listener) = listener {
            wake_accept(&listener);
        }
        for stream in upgrading.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        for conn in connections.values() {
            conn.force_close();
        }

        tracing::debug!(
            parent: &self.shared.span,
            upgrading = upgrading.len(),
            connections = connections.len(),
            "waiting for websocket threads"
        );
        self.shared.threads.wait();
        tracing::info!(parent: &self.shared.span, "websocket server closed");
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().local_addr
    }

    /// Number of upgraded live connections
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    pub fn connections(&self) -> Vec<Arc<WsConnection>> {
        self.shared.state.lock().connections.values().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}
