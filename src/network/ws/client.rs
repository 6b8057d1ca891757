//! WebSocket Client
//!
//! Dials a `ws://` URL and serves at most one connection at a time,
//! optionally re-dialing with backoff.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tungstenite::client::IntoClientRequest;

use crate::config::{ClientConfig, ConnectionConfig};
use crate::error::{NetError, Result};
use crate::network::dial::Dialer;
use crate::network::Backoff;

use super::{WsConnection, WsHandler};

struct WsClientState {
    /// Dialed socket still in the upgrade handshake
    upgrading: Option<TcpStream>,
    connection: Option<Arc<WsConnection>>,
    runner: Option<ThreadId>,
    closed: bool,
}

struct WsClientShared {
    url: String,
    dial_timeout: Duration,
    connection_config: ConnectionConfig,
    retry: AtomicBool,
    state: Mutex<WsClientState>,
    dialer: Dialer,
    wake: Condvar,
    span: tracing::Span,
}

/// WebSocket client handle. Clones share the same client.
///
/// `config.addr` holds the URL. Only plain `ws://` is supported.
#[derive(Clone)]
pub struct WsClient {
    shared: Arc<WsClientShared>,
}

impl WsClient {
    pub fn new(config: ClientConfig) -> Self {
        let span = tracing::info_span!("ws_client", url = %config.addr);
        Self {
            shared: Arc::new(WsClientShared {
                url: config.addr,
                dial_timeout: config.dial_timeout,
                connection_config: config.connection,
                retry: AtomicBool::new(config.retry),
                state: Mutex::new(WsClientState {
                    upgrading: None,
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

    /// Dial, upgrade and serve on the calling thread.
    ///
    /// Same retry and close behavior as `Client::dial_and_serve`; a failed
    /// upgrade counts as a failed dial. An unusable URL fails at once with
    /// `NetError::Config`, retry or not.
    pub fn dial_and_serve(&self, handler: Arc<dyn WsHandler>) -> Result<()> {
        let addr = socket_addr(&self.shared.url)?;
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(NetError::Closed("websocket client"));
            }
            if state.runner.is_some() {
                return Err(NetError::AlreadyRunning("websocket client"));
            }
            state.runner = Some(thread::current().id());
        }

        let result = {
            let _enter = self.shared.span.enter();
            self.dial_loop(&addr, &handler)
        };

        self.shared.state.lock().runner = None;
        self.shared.wake.notify_all();
        result
    }

    fn dial_loop(&self, addr: &str, handler: &Arc<dyn WsHandler>) -> Result<()> {
        let mut backoff = Backoff::dial();

        loop {
            let conn = match self.dial_once(addr) {
                Ok(Some(conn)) => conn,
                Ok(None) => return Ok(()),
                Err(e) => {
                    if self.is_closed() {
                        return Ok(());
                    }
                    if !self.retry_enabled() {
                        tracing::warn!(error = %e, "websocket dial failed");
                        return Err(e);
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, ?delay, "websocket dial failed; retrying");
                    if !self.sleep_unless_closed(delay) {
                        return Ok(());
                    }
                    continue;
                }
            };
            backoff.reset();
            tracing::debug!(id = conn.id().as_u64(), "connected");

            let served = conn.serve(handler);
            self.shared.state.lock().connection = None;
            served?;

            if self.is_closed() || !self.retry_enabled() {
                return Ok(());
            }
            tracing::debug!("connection ended; redialing");
        }
    }

    /// Connect and upgrade once. `None` if the client closed meanwhile.
    fn dial_once(&self, addr: &str) -> Result<Option<Arc<WsConnection>>> {
        let timeout = self.shared.dial_timeout;
        let stream = self.shared.dialer.connect(addr, timeout)?;

        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Ok(None);
            }
            state.upgrading = Some(stream.try_clone()?);
        }

        let request = self.shared.url.as_str().into_client_request();
        let upgraded = request
            .map_err(NetError::from)
            .and_then(|request| {
                WsConnection::connect(stream, request, &self.shared.connection_config, timeout)
            });

        let mut state = self.shared.state.lock();
        state.upgrading = None;
        let conn = upgraded?;
        if state.closed {
            drop(state);
            conn.force_close();
            return Ok(None);
        }
        state.connection = Some(Arc::clone(&conn));
        Ok(Some(conn))
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

    /// Stop dialing and force-close the current connection. Idempotent.
    ///
    /// A connect or upgrade in progress is aborted. Blocks like
    /// `Client::close` until `dial_and_serve` has returned.
    pub fn close(&self) {
        let (first, upgrading, connection) = {
            let mut state = self.shared.state.lock();
            let first = !state.closed;
            state.closed = true;
            (first, state.upgrading.take(), state.connection.take())
        };
        if first {
            self.shared.wake.notify_all();
            self.shared.dialer.cancel();
        }

        if let Some(stream) = upgrading {
            let _ = stream.shutdown(Shutdown::Both);
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
            tracing::info!(parent: &self.shared.span, "websocket client closed");
        }
    }

    /// The live connection, `None` between connections or once closed
    pub fn connection(&self) -> Option<Arc<WsConnection>> {
        let state = self.shared.state.lock();
        if state.closed {
            return None;
        }
        state.connection.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }
}

/// host:port to dial for a `ws://` URL
fn socket_addr(url: &str) -> Result<String> {
    let request = url
        .into_client_request()
        .map_err(|e| NetError::Config(format!("invalid websocket url {url:?}: {e}")))?;
    let uri = request.uri();

    match uri.scheme_str() {
        Some("ws") => {}
        Some("wss") => {
            return Err(NetError::Config(format!(
                "{url:?}: wss:// needs TLS, which WsClient does not provide"
            )))
        }
        _ => return Err(NetError::Config(format!("{url:?} is not a ws:// url"))),
    }
    let host = uri
        .host()
        .ok_or_else(|| NetError::Config(format!("{url:?} has no host")))?;
    Ok(format!("{}:{}", host, uri.port_u16().unwrap_or(80)))
}
