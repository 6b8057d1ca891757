//! WebSocket transport
//!
//! The same threading and close model as the framed TCP transport, with
//! WebSocket messages in place of codec frames.
//!
//! ## Architecture
//! - WsServer: one accept thread, one thread per socket; the upgrade
//!   handshake runs on the socket's own thread under a deadline
//! - WsClient: dials a `ws://` URL and serves at most one connection at a
//!   time, re-dialing with backoff when retry is enabled
//! - WsConnection: a reader thread and a dedicated writer thread sharing
//!   the outbound queue and backpressure reporting of `Connection`
//!
//! Pings are answered by the writer; after the outbound queue drains the
//! writer sends a normal-closure close frame.

mod client;
mod connection;
mod handler;
mod server;

pub use client::WsClient;
pub use connection::WsConnection;
pub use handler::{NoopWsHandler, WsHandler, WsMessage};
pub use server::WsServer;
