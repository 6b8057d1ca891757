//! Error types for netloop
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using NetError
pub type Result<T> = std::result::Result<T, NetError>;

/// Unified error type for netloop operations
#[derive(Debug, Error)]
pub enum NetError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Framing Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    /// The named resource was closed before or during the operation
    #[error("{0} closed")]
    Closed(&'static str),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("Server is not listening")]
    NotListening,

    // -------------------------------------------------------------------------
    // Submission Errors
    // -------------------------------------------------------------------------
    #[error("Queue is full")]
    Full,

    #[error("Operation cancelled")]
    Cancelled,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl NetError {
    /// True if this error reports a deliberately closed resource
    pub fn is_closed(&self) -> bool {
        matches!(self, NetError::Closed(_))
    }
}
