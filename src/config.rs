//! Configuration for netloop
//!
//! Everything is passed explicitly at construction; there is no global
//! configuration and nothing is read from the environment.

use std::time::Duration;

/// Default high-water mark for queued-but-unwritten bytes (4 MiB)
pub const DEFAULT_HIGH_WATER_BYTES: usize = 4 * 1024 * 1024;

/// Default bound on a single connect attempt
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for a WebSocket upgrade on an accepted socket
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Pending outbound bytes above which `send` reports backpressure (0 = off)
    pub high_water_bytes: usize,

    /// Pending outbound frames above which `send` reports backpressure (0 = off)
    pub high_water_frames: usize,

    /// Disable Nagle's algorithm on the socket
    pub no_delay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            high_water_bytes: DEFAULT_HIGH_WATER_BYTES,
            high_water_frames: 0,
            no_delay: true,
        }
    }
}

impl ConnectionConfig {
    pub fn with_high_water_bytes(mut self, bytes: usize) -> Self {
        self.high_water_bytes = bytes;
        self
    }

    pub fn with_high_water_frames(mut self, frames: usize) -> Self {
        self.high_water_frames = frames;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listen address (host:port). Empty means any interface, ephemeral port.
    pub listen_addr: String,

    /// Settings applied to every accepted connection
    pub connection: ConnectionConfig,

    /// How long a `WsServer` waits for a client's upgrade request
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7000".to_string(),
            connection: ConnectionConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Create a new config builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Address actually handed to the listener
    pub(crate) fn bind_addr(&self) -> &str {
        if self.listen_addr.is_empty() {
            "0.0.0.0:0"
        } else {
            &self.listen_addr
        }
    }
}

/// Builder for ServerConfig
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the per-connection settings
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.config.connection = connection;
        self
    }

    /// Set the high-water mark (bytes) for accepted connections
    pub fn high_water_bytes(mut self, bytes: usize) -> Self {
        self.config.connection.high_water_bytes = bytes;
        self
    }

    /// Set the WebSocket upgrade deadline
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Target address: host:port for `Client`, a ws:// URL for `WsClient`
    pub addr: String,

    /// Keep dialing with backoff instead of failing on the first error
    pub retry: bool,

    /// Give up on a single connect attempt after this long. A `WsClient`
    /// applies it to the upgrade handshake as well.
    pub dial_timeout: Duration,

    /// Settings applied to each dialed connection
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:7000".to_string(),
            retry: false,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new config builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the target address
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addr = addr.into();
        self
    }

    /// Enable or disable dial retry
    pub fn retry(mut self, retry: bool) -> Self {
        self.config.retry = retry;
        self
    }

    /// Bound a single connect attempt
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    /// Set the per-connection settings
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.config.connection = connection;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
