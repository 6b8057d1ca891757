//! Network Module
//!
//! TCP server, client and the per-connection engine, plus the same trio
//! over WebSocket.
//!
//! ## Architecture
//! - Server: one accept thread (the caller of `serve`), one thread per
//!   connection
//! - Client: one dial thread (the caller of `dial_and_serve`), at most one
//!   connection at a time; `close` aborts a connect in progress
//! - Connection: a reader thread and a dedicated writer thread
//! - Handlers receive callbacks on the reader thread, or on an `EventLoop`
//!   through `LoopHandler`
//! - ws: `WsServer`, `WsClient` and `WsConnection` share the outbound queue,
//!   dialer and backoff with the TCP side

mod backoff;
mod client;
mod connection;
mod dial;
mod handler;
mod send_queue;
mod server;
pub mod ws;

pub use backoff::{
    Backoff, ACCEPT_BACKOFF_INITIAL, ACCEPT_BACKOFF_MAX, DIAL_BACKOFF_INITIAL, DIAL_BACKOFF_MAX,
};
pub use client::Client;
pub use connection::{Connection, ConnectionId, SendStatus};
pub use handler::{Handler, LoopHandler, NoopHandler};
pub use server::Server;
pub use ws::{NoopWsHandler, WsClient, WsConnection, WsHandler, WsMessage, WsServer};
