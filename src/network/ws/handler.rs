//! WebSocket messages and handlers

use std::sync::Arc;

use bytes::Bytes;
use tungstenite::Message;

use super::WsConnection;

/// An application-level WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
}

impl WsMessage {
    pub fn len(&self) -> usize {
        match self {
            WsMessage::Text(text) => text.len(),
            WsMessage::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_text(&self) -> bool {
        matches!(self, WsMessage::Text(_))
    }

    /// Payload bytes, whatever the message type
    pub fn into_bytes(self) -> Bytes {
        match self {
            WsMessage::Text(text) => Bytes::from(text),
            WsMessage::Binary(data) => data,
        }
    }
}

impl From<String> for WsMessage {
    fn from(text: String) -> Self {
        WsMessage::Text(text)
    }
}

impl From<&str> for WsMessage {
    fn from(text: &str) -> Self {
        WsMessage::Text(text.to_string())
    }
}

impl From<Bytes> for WsMessage {
    fn from(data: Bytes) -> Self {
        WsMessage::Binary(data)
    }
}

impl From<Vec<u8>> for WsMessage {
    fn from(data: Vec<u8>) -> Self {
        WsMessage::Binary(Bytes::from(data))
    }
}

impl From<&'static [u8]> for WsMessage {
    fn from(data: &'static [u8]) -> Self {
        WsMessage::Binary(Bytes::from_static(data))
    }
}

impl From<WsMessage> for Message {
    fn from(message: WsMessage) -> Self {
        match message {
            WsMessage::Text(text) => Message::Text(text),
            WsMessage::Binary(data) => Message::Binary(data.to_vec()),
        }
    }
}

/// Callbacks for one side of a WebSocket connection.
///
/// Same ordering guarantees as `Handler`: `connect(conn, true)` first,
/// non-overlapping `receive` calls in wire order, and `connect(conn, false)`
/// exactly once at the end. Control frames never reach the handler.
pub trait WsHandler: Send + Sync + 'static {
    fn connect(&self, conn: &Arc<WsConnection>, connected: bool) {
        let _ = (conn, connected);
    }

    fn receive(&self, conn: &Arc<WsConnection>, message: WsMessage) {
        let _ = (conn, message);
    }
}

/// WebSocket handler that ignores every callback
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWsHandler;

impl WsHandler for NoopWsHandler {}

impl<H: WsHandler + ?Sized> WsHandler for Arc<H> {
    fn connect(&self, conn: &Arc<WsConnection>, connected: bool) {
        (**self).connect(conn, connected)
    }

    fn receive(&self, conn: &Arc<WsConnection>, message: WsMessage) {
        (**self).receive(conn, message)
    }
}

