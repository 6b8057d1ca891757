//! WebSocket connection
//!
//! Per-socket engine for an upgraded connection.
//!
//! ## Threads
//! - reader: the thread calling `serve`; reads messages and dispatches them
//! - writer: spawned by `serve`; the only thread that writes the socket once
//!   the handshake is over, control replies included
//!
//! ## Termination
//! - peer close frame or end-of-stream: outbound queue closes, writer
//!   flushes what was queued, answers with a normal-closure close frame
//! - read error, write error, handler panic: both directions abort
//! - `force_close`: SO_LINGER 0 + abort, queued messages are discarded

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use socket2::SockRef;
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::HandshakeRole;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, Role};
use tungstenite::{error::ProtocolError, HandshakeError, Message, WebSocket};

use crate::config::ConnectionConfig;
use crate::error::{NetError, Result};
use crate::network::connection::{dispatch, log_termination, ReadEnd};
use crate::network::send_queue::{Payload, SendQueue};
use crate::network::{ConnectionId, SendStatus};
use crate::sync::panic_message;

use super::{WsHandler, WsMessage};

impl Payload for Message {
    fn payload_len(&self) -> usize {
        self.len()
    }
}

/// The reader's end of the socket.
///
/// Carries the handshake in both directions, then only reads: once the
/// connection is live every write goes through the writer thread, so
/// anything the reader's protocol state tries to write (automatic pong and
/// close replies) is discarded here and sent by the writer instead.
pub(crate) struct ReadHalf {
    stream: TcpStream,
    handshaking: bool,
}

impl ReadHalf {
    fn new(stream: &TcpStream) -> io::Result<Self> {
        Ok(Self {
            stream: stream.try_clone()?,
            handshaking: true,
        })
    }
}

impl Read for ReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for ReadHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.handshaking {
            self.stream.write(buf)
        } else {
            Ok(buf.len())
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.handshaking {
            self.stream.flush()
        } else {
            Ok(())
        }
    }
}

/// A WebSocket connection
pub struct WsConnection {
    id: ConnectionId,
    stream: TcpStream,
    role: Role,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,

    /// Protocol state of the read side, taken by `serve`
    reader: Mutex<Option<WebSocket<ReadHalf>>>,

    /// Messages waiting for the writer, control replies included
    outbound: SendQueue<Message>,

    aborted: AtomicBool,
    closed: AtomicBool,

    /// Dropped when the connection has fully terminated
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,

    span: tracing::Span,
}

impl WsConnection {
    /// Run the server side of the upgrade on an accepted socket
    pub(crate) fn accept(
        id: ConnectionId,
        stream: TcpStream,
        config: &ConnectionConfig,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let reader = tungstenite::accept(ReadHalf::new(&stream)?).map_err(handshake_error)?;
        stream.set_read_timeout(None)?;
        Self::new(id, stream, reader, Role::Server, config)
    }

    /// Run the client side of the upgrade on a dialed socket
    pub(crate) fn connect<R: IntoClientRequest>(
        stream: TcpStream,
        request: R,
        config: &ConnectionConfig,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let (reader, _response) =
            tungstenite::client(request, ReadHalf::new(&stream)?).map_err(handshake_error)?;
        stream.set_read_timeout(None)?;
        Self::new(ConnectionId::next(), stream, reader, Role::Client, config)
    }

    fn new(
        id: ConnectionId,
        stream: TcpStream,
        mut reader: WebSocket<ReadHalf>,
        role: Role,
        config: &ConnectionConfig,
    ) -> Result<Arc<Self>> {
        reader.get_mut().handshaking = false;
        stream.set_nodelay(config.no_delay)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (done_tx, done_rx) = channel::bounded(0);

        Ok(Arc::new(Self {
            id,
            stream,
            role,
            local_addr,
            peer_addr,
            reader: Mutex::new(Some(reader)),
            outbound: SendQueue::new(config),
            aborted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            span: tracing::debug_span!("ws", id = id.as_u64(), peer = %peer_addr),
        }))
    }

    // =========================================================================
    // Serving
    // =========================================================================

    /// Run the connection until it terminates.
    ///
    /// Spawns the writer thread and reads on the calling thread. Fails only
    /// if the connection was already served or the writer could not be
    /// started; in both cases no handler callback has run.
    pub fn serve(self: &Arc<Self>, handler: &Arc<dyn WsHandler>) -> Result<()> {
        let Some(mut reader) = self.reader.lock().take() else {
            return Err(NetError::AlreadyRunning("websocket connection"));
        };
        let _enter = self.span.enter();

        let writer = self.stream.try_clone().and_then(|stream| {
            let conn = Arc::clone(self);
            let span = self.span.clone();
            let mut socket = WebSocket::from_raw_socket(stream, self.role, None);
            thread::Builder::new()
                .name(format!("netloop-ws-writer-{}", self.id))
                .spawn(move || {
                    let _enter = span.enter();
                    let result = conn.write_loop(&mut socket);
                    if result.is_err() {
                        conn.abort_io();
                    }
                    result
                })
        });
        let writer = match writer {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "failed to start websocket writer");
                self.abort_io();
                self.finish();
                return Err(e.into());
            }
        };

        let read_end = if dispatch(|| handler.connect(self, true)) {
            self.read_loop(&mut reader, handler)
        } else {
            ReadEnd::HandlerPanicked
        };

        match read_end {
            ReadEnd::PeerClosed => {
                self.outbound.close();
            }
            _ => self.abort_io(),
        }

        let write_end = writer.join().unwrap_or_else(|payload| {
            Err(NetError::Protocol(format!(
                "writer panicked: {}",
                panic_message(&*payload)
            )))
        });

        let _ = self.stream.shutdown(Shutdown::Both);
        log_termination(&read_end, &write_end, self.aborted.load(Ordering::Acquire));
        self.finish();

        dispatch(|| handler.connect(self, false));
        Ok(())
    }

    fn read_loop(
        self: &Arc<Self>,
        reader: &mut WebSocket<ReadHalf>,
        handler: &Arc<dyn WsHandler>,
    ) -> ReadEnd {
        loop {
            let message = match reader.read() {
                Ok(Message::Text(text)) => WsMessage::Text(text),
                Ok(Message::Binary(data)) => WsMessage::Binary(Bytes::from(data)),
                Ok(Message::Ping(data)) => {
                    self.outbound.push(Message::Pong(data));
                    continue;
                }
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(frame)) => {
                    tracing::trace!(?frame, "close frame received");
                    return ReadEnd::PeerClosed;
                }
                Err(e) => return self.classify_read_error(e),
            };
            if !dispatch(|| handler.receive(self, message)) {
                return ReadEnd::HandlerPanicked;
            }
        }
    }

    /// A peer that hangs up between messages, with or without a close
    /// frame, has closed; any other error fails the connection.
    fn classify_read_error(&self, error: tungstenite::Error) -> ReadEnd {
        if self.aborted.load(Ordering::Acquire) {
            return ReadEnd::Aborted;
        }
        match error {
            tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                ReadEnd::PeerClosed
            }
            other => ReadEnd::Failed(other.into()),
        }
    }

    /// Drain the outbound queue, then send the close frame
    fn write_loop(&self, socket: &mut WebSocket<TcpStream>) -> Result<()> {
        while let Some(batch) = self.outbound.take_all() {
            let frames = batch.len();
            let bytes = batch.iter().map(Message::len).sum();
            if self.aborted.load(Ordering::Acquire) {
                self.outbound.written(bytes, frames);
                continue;
            }
            for message in batch {
                socket.write(message)?;
            }
            socket.flush()?;
            self.outbound.written(bytes, frames);
        }

        if self.aborted.load(Ordering::Acquire) {
            return Ok(());
        }
        let goodbye = socket
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed(""),
            }))
            .and_then(|()| socket.flush());
        match goodbye {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(_) if self.aborted.load(Ordering::Acquire) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn finish(&self) {
        self.outbound.close();
        self.closed.store(true, Ordering::Release);
        self.done_tx.lock().take();
    }

    fn abort_io(&self) {
        self.outbound.close();
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Queue one message for the writer.
    ///
    /// Never blocks; reports `Backpressure` and `Dropped` the same way as
    /// `Connection::send`.
    pub fn send(&self, message: impl Into<WsMessage>) -> SendStatus {
        let status = self.outbound.push(message.into().into());
        if status.is_dropped() {
            tracing::trace!(parent: &self.span, "send dropped: write side closed");
        }
        status
    }

    /// Change the backpressure thresholds (0 disables one)
    pub fn set_high_water_mark(&self, bytes: usize, frames: usize) {
        self.outbound.set_high_water_mark(bytes, frames);
    }

    pub fn pending_bytes(&self) -> usize {
        self.outbound.pending_bytes()
    }

    pub fn pending_frames(&self) -> usize {
        self.outbound.pending_frames()
    }

    // =========================================================================
    // Closing
    // =========================================================================

    /// Flush everything already queued, then send a close frame.
    ///
    /// Reads continue until the peer answers with its own close frame or
    /// hangs up. Idempotent.
    pub fn shutdown(&self) {
        if self.outbound.close() {
            tracing::debug!(parent: &self.span, "shutdown requested");
        }
    }

    /// Abort the socket immediately without a close frame. Idempotent.
    ///
    /// Same semantics as `Connection::force_close`.
    pub fn force_close(&self) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(parent: &self.span, "force close");

        self.outbound.close();
        if let Err(e) = SockRef::from(&self.stream).set_linger(Some(Duration::ZERO)) {
            tracing::trace!(parent: &self.span, error = %e, "failed to set linger");
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// `shutdown` now, and `force_close` if still open after `timeout`
    pub fn close_with_timeout(self: &Arc<Self>, timeout: Duration) {
        self.shutdown();

        let weak = Arc::downgrade(self);
        let done = self.done_rx.clone();
        let spawned = thread::Builder::new()
            .name(format!("netloop-ws-deadline-{}", self.id))
            .spawn(move || {
                crossbeam::select! {
                    recv(done) -> _ => {},
                    recv(channel::after(timeout)) -> _ => {
                        if let Some(conn) = weak.upgrade() {
                            tracing::debug!(parent: &conn.span, "shutdown deadline passed");
                            conn.force_close();
                        }
                    },
                }
            });

        if let Err(e) = spawned {
            tracing::warn!(parent: &self.span, error = %e, "no deadline thread; forcing close now");
            self.force_close();
        }
    }

    /// Block until the connection has fully terminated or `timeout` elapses
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        if self.is_closed() {
            return true;
        }
        matches!(
            self.done_rx.recv_timeout(timeout),
            Err(channel::RecvTimeoutError::Disconnected)
        )
    }

    pub fn is_write_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

/// A handshake that stalls past its read deadline surfaces as `Interrupted`
fn handshake_error<R: HandshakeRole>(error: HandshakeError<R>) -> NetError {
    match error {
        HandshakeError::Failure(e) => e.into(),
        HandshakeError::Interrupted(_) => {
            io::Error::new(io::ErrorKind::TimedOut, "websocket handshake timed out").into()
        }
    }
}

impl fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("pending_bytes", &self.pending_bytes())
            .field("write_closed", &self.is_write_closed())
            .field("closed", &self.is_closed())
            .finish()
    }
}
