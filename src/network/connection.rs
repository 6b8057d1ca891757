//! Connection
//!
//! Per-socket read/write engine.
//!
//! ## Threads
//! - reader: the thread calling `serve`; decodes frames and dispatches them
//! - writer: spawned by `serve`; the only thread that ever writes the socket
//!
//! ## Termination
//! - peer end-of-stream: outbound queue closes, writer flushes what was
//!   already queued, then half-closes
//! - read/decode error, write error, handler panic: both directions abort
//! - `force_close`: SO_LINGER 0 + abort, queued frames are discarded
//!
//! In every case `Handler::connect(conn, false)` runs once both threads
//! are done.

use std::any::Any;
use std::fmt;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use socket2::SockRef;

use crate::config::ConnectionConfig;
use crate::error::{NetError, Result};
use crate::protocol::Codec;
use crate::sync::panic_message;

use super::send_queue::SendQueue;
use super::Handler;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(super) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a `send` that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Queued, pending data below the high-water mark
    Queued,

    /// Queued, but pending data is above the high-water mark; slow down
    Backpressure {
        pending_bytes: usize,
        pending_frames: usize,
    },

    /// Not queued: the write side was already shut down or closed
    Dropped,
}

impl SendStatus {
    pub fn is_backpressure(&self) -> bool {
        matches!(self, SendStatus::Backpressure { .. })
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, SendStatus::Dropped)
    }
}

/// Why the reader stopped
pub(super) enum ReadEnd {
    PeerClosed,
    Aborted,
    Failed(NetError),
    HandlerPanicked,
}

/// A framed TCP connection
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    codec: Arc<dyn Codec>,

    /// Frames waiting for the writer
    outbound: SendQueue<Bytes>,

    served: AtomicBool,
    aborted: AtomicBool,
    closed: AtomicBool,

    /// Dropped when the connection has fully terminated
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,

    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    span: tracing::Span,
}

impl Connection {
    /// Wrap a connected stream.
    ///
    /// Nothing is read or written until `serve` runs; frames sent before that
    /// are queued and flushed once the writer starts.
    pub fn new(
        stream: TcpStream,
        codec: Arc<dyn Codec>,
        config: &ConnectionConfig,
    ) -> Result<Arc<Self>> {
        stream.set_nodelay(config.no_delay)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        let id = ConnectionId::next();
        let (done_tx, done_rx) = channel::bounded(0);

        Ok(Arc::new(Self {
            id,
            stream,
            local_addr,
            peer_addr,
            codec,
            outbound: SendQueue::new(config),
            served: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            user_data: Mutex::new(None),
            span: tracing::debug_span!("conn", id = id.0, peer = %peer_addr),
        }))
    }

    // =========================================================================
    // Serving
    // =========================================================================

    /// Run the connection until it terminates.
    ///
    /// Spawns the writer thread and reads on the calling thread. Fails only
    /// if the connection was already served or the writer could not be
    /// spawned; in both cases no handler callback has run.
    pub fn serve(self: &Arc<Self>, handler: &Arc<dyn Handler>) -> Result<()> {
        if self.served.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyRunning("connection"));
        }
        let _enter = self.span.enter();

        let conn = Arc::clone(self);
        let span = self.span.clone();
        let writer = thread::Builder::new()
            .name(format!("netloop-writer-{}", self.id))
            .spawn(move || {
                let _enter = span.enter();
                let result = conn.write_loop();
                if result.is_err() {
                    conn.abort_io();
                }
                result
            });
        let writer = match writer {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn writer thread");
                self.abort_io();
                self.finish();
                return Err(e.into());
            }
        };

        let read_end = if dispatch(|| handler.connect(self, true)) {
            self.read_loop(handler)
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

    fn read_loop(self: &Arc<Self>, handler: &Arc<dyn Handler>) -> ReadEnd {
        let mut reader = BufReader::new(&self.stream);
        loop {
            match self.codec.decode(&mut reader) {
                Ok(frame) => {
                    if !dispatch(|| handler.receive(self, frame)) {
                        return ReadEnd::HandlerPanicked;
                    }
                }
                Err(e) => return self.classify_read_error(e),
            }
        }
    }

    /// A clean end of stream between frames is the peer closing; anything
    /// else, a truncated frame included, fails the connection.
    fn classify_read_error(&self, error: NetError) -> ReadEnd {
        if self.aborted.load(Ordering::Acquire) {
            return ReadEnd::Aborted;
        }
        match error {
            NetError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => ReadEnd::PeerClosed,
            other => ReadEnd::Failed(other),
        }
    }

    /// Drain the outbound queue batch by batch until it is closed and empty
    fn write_loop(&self) -> Result<()> {
        let mut writer = BufWriter::new(&self.stream);

        while let Some(batch) = self.outbound.take_all() {
            let frames = batch.len();
            let bytes = batch.iter().map(Bytes::len).sum();
            if self.aborted.load(Ordering::Acquire) {
                // force_close: whatever is still queued is dropped unwritten
                self.outbound.written(bytes, frames);
                continue;
            }
            for frame in &batch {
                self.codec.encode(&mut writer, frame)?;
            }
            writer.flush()?;
            self.outbound.written(bytes, frames);
        }

        writer.flush()?;
        match self.stream.shutdown(Shutdown::Write) {
            Ok(()) => Ok(()),
            Err(_) if self.aborted.load(Ordering::Acquire) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn finish(&self) {
        self.outbound.close();
        self.closed.store(true, Ordering::Release);
        self.done_tx.lock().take();
    }

    /// Stop both directions without SO_LINGER changes
    fn abort_io(&self) {
        self.outbound.close();
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Queue one frame for the writer.
    ///
    /// Never blocks. Reports `Backpressure` (the frame is still queued) on
    /// every call made while pending bytes or frames are above the high-water
    /// mark, and `Dropped` once the write side is shut down.
    pub fn send(&self, frame: impl Into<Bytes>) -> Result<SendStatus> {
        let frame = frame.into();
        let max = self.codec.max_frame_len();
        if frame.len() > max {
            return Err(NetError::FrameTooLarge {
                len: frame.len(),
                max,
            });
        }

        let status = self.outbound.push(frame);
        if status.is_dropped() {
            tracing::trace!(parent: &self.span, "send dropped: write side closed");
        }
        Ok(status)
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

    /// Flush everything already queued, then close the write half.
    ///
    /// Reads continue until the peer closes its side. Idempotent.
    pub fn shutdown(&self) {
        if self.outbound.close() {
            tracing::debug!(parent: &self.span, "shutdown requested");
        }
    }

    /// Abort the socket immediately. Idempotent.
    ///
    /// Frames still in the send queue are dropped unwritten. Both directions are
    /// shut down at once, which unblocks the reader and writer threads, but
    /// bytes the kernel already holds in the socket send buffer still go
    /// out, followed by a FIN. The reset that discards them (SO_LINGER 0) is
    /// only sent when the descriptor is closed, i.e. when the last
    /// `Arc<Connection>` is dropped.
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
            .name(format!("netloop-deadline-{}", self.id))
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

    /// Alias of `close_with_timeout`
    pub fn shutdown_in(self: &Arc<Self>, timeout: Duration) {
        self.close_with_timeout(timeout)
    }

    /// Block until the connection has fully terminated or `timeout` elapses.
    ///
    /// Returns true if it terminated.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        if self.is_closed() {
            return true;
        }
        matches!(
            self.done_rx.recv_timeout(timeout),
            Err(channel::RecvTimeoutError::Disconnected)
        )
    }

    /// True once no more frames will be accepted by `send`
    pub fn is_write_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// True once both threads have exited and the socket is shut down
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

    pub fn set_no_delay(&self, no_delay: bool) -> Result<()> {
        self.stream.set_nodelay(no_delay)?;
        Ok(())
    }

    /// Attach application state, replacing any previous value
    pub fn set_user_data<T: Any + Send + Sync>(&self, value: T) {
        *self.user_data.lock() = Some(Arc::new(value));
    }

    /// Fetch the attached state if it has type `T`
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.user_data.lock().clone()?;
        data.downcast::<T>().ok()
    }

    pub fn take_user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_data.lock().take()
    }
}

/// Run a handler callback, containing any panic. False if it panicked.
pub(super) fn dispatch<F: FnOnce()>(callback: F) -> bool {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => true,
        Err(payload) => {
            tracing::error!(panic = %panic_message(&*payload), "handler panicked");
            false
        }
    }
}

/// Log why a connection ended; errors caused by a local abort stay quiet
pub(super) fn log_termination(read_end: &ReadEnd, write_end: &Result<()>, aborted: bool) {
    if let Err(e) = write_end {
        if !aborted {
            tracing::warn!(error = %e, "connection write failed");
            return;
        }
    }
    match read_end {
        ReadEnd::PeerClosed => tracing::debug!("peer closed connection"),
        ReadEnd::Aborted => tracing::debug!("connection closed locally"),
        ReadEnd::Failed(e) => tracing::warn!(error = %e, "connection read failed"),
        ReadEnd::HandlerPanicked => tracing::warn!("connection ended by handler panic"),
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("pending_bytes", &self.pending_bytes())
            .field("write_closed", &self.is_write_closed())
            .field("closed", &self.is_closed())
            .finish()
    }
}
