//! Typed errors for each component boundary.
//!
//! Nothing here crosses a component boundary as a panic: the receiver turns
//! `StreamError` into an `Error` status, the output swallows `OutputError`
//! after `start()`, and the bridge converts `BridgeError` into empty results
//! where callers only care about presence.

use std::time::Duration;
use thiserror::Error;

/// Failures on the ingest side: transport, decode and capture backends.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("server responded with HTTP {0}")]
    Status(u16),

    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A single frame could not be decoded. Recoverable.
    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("failed to open stream: {0}")]
    CaptureOpen(String),

    #[error("lost connection: {0}")]
    CaptureRead(String),
}

impl StreamError {
    /// Decode failures are dropped per frame; everything else ends the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

/// Failures of the virtual output device.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("virtual output device not available: {0}")]
    Unavailable(String),

    #[error("failed to open virtual output device: {0}")]
    Open(String),

    #[error("permission denied for {0}, try adding user to 'video' group")]
    PermissionDenied(String),

    #[error("unsupported frame format: {0}")]
    Format(String),

    #[error("virtual output write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("virtual output not started")]
    NotStarted,
}

/// Failures invoking the external bridge tool.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge tool not found: {0}")]
    ToolMissing(String),

    #[error("bridge command timed out after {0:?}")]
    Timeout(Duration),

    #[error("bridge command exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("bridge command I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
}
