//! netloop Echo Client
//!
//! Connects to an echo server, sends a batch of frames and prints what comes
//! back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use netloop::{Client, ClientConfig, Connection, Handler, LengthPrefixedCodec};
use tracing_subscriber::{fmt, EnvFilter};

/// netloop echo client
#[derive(Parser, Debug)]
#[command(name = "netloop-echo-client")]
#[command(about = "Send frames to an echo server and print the replies")]
#[command(version)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    server: String,

    /// Number of frames to send
    #[arg(short, long, default_value = "3")]
    count: usize,

    /// Frame text; the sequence number is appended
    #[arg(short, long, default_value = "hello")]
    message: String,

    /// Keep re-dialing with backoff until the server is reachable
    #[arg(short, long)]
    retry: bool,
}

struct EchoClient {
    client: Client,
    message: String,
    count: usize,
    received: AtomicUsize,
}

impl Handler for EchoClient {
    fn connect(&self, conn: &Arc<Connection>, connected: bool) {
        if !connected {
            tracing::info!(conn = %conn.id(), "disconnected");
            return;
        }

        tracing::info!(conn = %conn.id(), local = %conn.local_addr(), "connected");
        self.received.store(0, Ordering::Release);
        for seq in 0..self.count {
            let frame = format!("{}-{}", self.message, seq);
            if let Err(e) = conn.send(frame) {
                tracing::error!(error = %e, "send failed");
                self.client.close();
                return;
            }
        }
    }

    fn receive(&self, _conn: &Arc<Connection>, frame: Bytes) {
        println!("{}", String::from_utf8_lossy(&frame));
        if self.received.fetch_add(1, Ordering::AcqRel) + 1 >= self.count {
            self.client.close();
        }
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    if args.count == 0 {
        return;
    }

    let config = ClientConfig::builder()
        .addr(&args.server)
        .retry(args.retry)
        .build();
    let client = Client::new(config);

    let handler = Arc::new(EchoClient {
        client: client.clone(),
        message: args.message,
        count: args.count,
        received: AtomicUsize::new(0),
    });

    if let Err(e) = client.dial_and_serve(handler, Arc::new(LengthPrefixedCodec)) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
