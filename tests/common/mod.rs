//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use netloop::network::ConnectionId;
use netloop::{Connection, Handler};
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::{LookupSpan, Registry};
use tracing_subscriber::Layer;

/// Generous bound for anything that should happen "promptly"
pub const WAIT: Duration = Duration::from_secs(5);

/// Two connected sockets on the loopback interface
pub fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

/// A loopback address nothing is listening on (at the time of the call)
pub fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Write one length-prefixed frame with plain std I/O
pub fn write_raw_frame(stream: &mut TcpStream, payload: &[u8]) {
    let len = u16::try_from(payload.len()).unwrap();
    stream.write_all(&len.to_be_bytes()).unwrap();
    stream.write_all(payload).unwrap();
}

/// Read one length-prefixed frame with plain std I/O
pub fn read_raw_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();
    let mut payload = vec![0u8; u16::from_be_bytes(header) as usize];
    stream.read_exact(&mut payload).unwrap();
    payload
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(ConnectionId),
    Received(ConnectionId, Bytes),
    Disconnected(ConnectionId),
}

/// Forwards every callback to a channel
pub struct Recorder {
    events: Sender<Event>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, Receiver<Event>) {
        let (tx, rx) = channel::unbounded();
        (Arc::new(Self { events: tx }), rx)
    }
}

impl Handler for Recorder {
    fn connect(&self, conn: &Arc<Connection>, connected: bool) {
        let event = if connected {
            Event::Connected(conn.id())
        } else {
            Event::Disconnected(conn.id())
        };
        let _ = self.events.send(event);
    }

    fn receive(&self, conn: &Arc<Connection>, frame: Bytes) {
        let _ = self.events.send(Event::Received(conn.id(), frame));
    }
}

/// Echoes every frame back, optionally shutting down after the first one
pub struct Echo {
    pub shutdown_after_reply: bool,
    pub events: Sender<Event>,
}

impl Handler for Echo {
    fn connect(&self, conn: &Arc<Connection>, connected: bool) {
        let event = if connected {
            Event::Connected(conn.id())
        } else {
            Event::Disconnected(conn.id())
        };
        let _ = self.events.send(event);
    }

    fn receive(&self, conn: &Arc<Connection>, frame: Bytes) {
        let _ = self.events.send(Event::Received(conn.id(), frame.clone()));
        conn.send(frame).unwrap();
        if self.shutdown_after_reply {
            conn.shutdown();
        }
    }
}

pub fn recv_event(rx: &Receiver<Event>) -> Event {
    rx.recv_timeout(WAIT).expect("handler event")
}

// =============================================================================
// Log Capture
// =============================================================================

/// One event recorded by `capture_logs`
#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: tracing::Level,
    pub message: String,
    pub fields: Vec<(String, String)>,
    /// Name of the span the event belongs to
    pub span: Option<String>,
}

impl LogLine {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

struct Capture(Arc<Mutex<Vec<LogLine>>>);

impl<S> Layer<S> for Capture
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        self.0.lock().push(LogLine {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
            span: ctx.event_span(event).map(|span| span.name().to_string()),
        });
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push((field.name().to_string(), format!("{:?}", value)));
        }
    }
}

/// Run `f` with a subscriber that records every event emitted on this thread
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, Vec<LogLine>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let subscriber = Registry::default().with(Capture(Arc::clone(&lines)));
    let output = tracing::subscriber::with_default(subscriber, f);
    let lines = lines.lock().clone();
    (output, lines)
}
