//! Crate-level error type.
//!
//! Only correlated operations (history requests, config loading, HTTP
//! fallback) surface these to callers. Fire-and-forget paths log and drop.

use thiserror::Error;

use crate::protocol::ChannelId;

/// Errors produced by the synchronization layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// The duplex channel is not open.
    #[error("not connected")]
    NotConnected,

    /// The socket could not be opened.
    #[error("connection to {url} refused: {detail}")]
    ConnectionRefused { url: String, detail: String },

    /// Failure on an already-open socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// No matching response arrived inside the request window.
    #[error("fetch for channel {channel_id} timed out after {after_ms}ms")]
    Timeout { channel_id: ChannelId, after_ms: u64 },

    /// The request was issued on a connection that has since been replaced.
    #[error("connection was reset before the response arrived")]
    ConnectionReset,

    /// The active server changed while a history load was running.
    #[error("history load superseded by a server switch")]
    Superseded,

    /// Inbound data that could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Non-2xx status from the HTTP history endpoint.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The session task has shut down.
    #[error("sync session closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Malformed(e.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(e: toml::de::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}
