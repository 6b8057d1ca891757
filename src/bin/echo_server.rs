//! netloop Echo Server
//!
//! Listens for length-prefixed frames and writes every frame back to its
//! sender. Handler callbacks run on a single event loop thread.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use netloop::event_loop::EventLoopThread;
use netloop::network::LoopHandler;
use netloop::{Connection, ConnectionConfig, Handler, LengthPrefixedCodec, Server, ServerConfig};
use tracing_subscriber::{fmt, EnvFilter};

/// netloop echo server
#[derive(Parser, Debug)]
#[command(name = "netloop-echo-server")]
#[command(about = "Echo every received frame back to its sender")]
#[command(version)]
struct Args {
    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    listen: String,

    /// Per-connection high-water mark in KiB (0 disables)
    #[arg(long, default_value = "4096")]
    high_water_kb: usize,

    /// Log the live connection count every N seconds (0 disables)
    #[arg(long, default_value = "0")]
    stats_secs: u64,
}

struct EchoHandler;

impl Handler for EchoHandler {
    fn connect(&self, conn: &Arc<Connection>, connected: bool) {
        if connected {
            tracing::info!(conn = %conn.id(), peer = %conn.peer_addr(), "client connected");
        } else {
            tracing::info!(conn = %conn.id(), "client disconnected");
        }
    }

    fn receive(&self, conn: &Arc<Connection>, frame: Bytes) {
        match conn.send(frame) {
            Ok(status) if status.is_backpressure() => {
                tracing::debug!(conn = %conn.id(), ?status, "peer is slow to read");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(conn = %conn.id(), error = %e, "echo failed; closing");
                conn.force_close();
            }
        }
    }
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,netloop=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("netloop echo server v{}", netloop::VERSION);

    let config = ServerConfig::builder()
        .listen_addr(&args.listen)
        .connection(ConnectionConfig::default().with_high_water_bytes(args.high_water_kb * 1024))
        .build();

    let loop_thread = match EventLoopThread::spawn("echo-loop") {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("Failed to start event loop: {}", e);
            std::process::exit(1);
        }
    };

    let server = Server::new(config);
    match server.listen() {
        Ok(addr) => tracing::info!("Listening on {}", addr),
        Err(e) => {
            tracing::error!("Failed to listen on {}: {}", args.listen, e);
            std::process::exit(1);
        }
    }

    let _stats = (args.stats_secs > 0).then(|| {
        let server = server.clone();
        loop_thread
            .event_loop()
            .schedule_every(Duration::from_secs(args.stats_secs), move || {
                tracing::info!(connections = server.connection_count(), "stats");
            })
    });

    let handler = LoopHandler::new(loop_thread.event_loop().clone(), EchoHandler);
    if let Err(e) = server.serve(Arc::new(handler), Arc::new(LengthPrefixedCodec)) {
        tracing::error!("Server error: {}", e);
        server.close();
        loop_thread.close();
        std::process::exit(1);
    }

    loop_thread.close();
    tracing::info!("Server stopped");
}
