//! # netloop
//!
//! A small blocking TCP networking engine with:
//! - Pluggable framing codecs (2-byte length prefix by default)
//! - A dedicated writer thread per connection with backpressure reporting
//! - Single-threaded event loops with one-shot timers and tickers
//! - A server with accept backoff and hard-stop close
//! - A client with optional exponential-backoff reconnect
//! - A WebSocket server and client over the same connection model
//! - A fixed-size worker pool for off-loading handler work
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────┐     ┌─────────────────────────────┐
//! │           Server            │     │           Client            │
//! │  (accept loop + backoff)    │     │   (dial loop + backoff)     │
//! └──────────────┬──────────────┘     └──────────────┬──────────────┘
//!                │  one per socket                   │
//!                ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Connection                             │
//! │   reader thread ── Codec::decode ──► Handler::receive           │
//! │   send() ──► MonitorQueue<Bytes> ──► writer thread ──► socket   │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                │ optional
//!                ┌───────────────┴───────────────┐
//!                ▼                               ▼
//!        ┌───────────────┐               ┌───────────────┐
//!        │   EventLoop   │               │  WorkerPool   │
//!        │ (timers/ticks)│               │  (N threads)  │
//!        └───────────────┘               └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod event_loop;
pub mod network;
pub mod protocol;
pub mod sync;
pub mod worker;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{ClientConfig, ConnectionConfig, ServerConfig};
pub use error::{NetError, Result};
pub use event_loop::{EventLoop, Ticker, Timer};
pub use network::{
    Client, Connection, Handler, SendStatus, Server, WsClient, WsConnection, WsHandler, WsMessage,
    WsServer,
};
pub use protocol::{Codec, LengthPrefixedCodec};
pub use sync::MonitorQueue;
pub use worker::WorkerPool;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of netloop
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
