//! Client configuration.
//!
//! Every field has a default matching the production GTalk deployment, so an
//! empty TOML document is a valid config:
//!
//! ```toml
//! endpoint = "wss://chat.example.com/ws"
//! http_base_url = "https://chat.example.com"
//! max_retries = 5
//! reconnect_interval_ms = 3000
//! request_timeout_ms = 5000
//! dedup_window_ms = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SyncError};

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/ws";
pub const DEFAULT_HTTP_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Duplex endpoint. The credential is appended as the `token` query parameter.
    pub endpoint: String,
    /// Base URL for the HTTP history fallback. Empty disables the fallback.
    pub http_base_url: String,
    /// Reconnect attempts allowed after an abnormal closure.
    pub max_retries: u32,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_interval_ms: u64,
    /// How long a correlated history request may stay unanswered.
    pub request_timeout_ms: u64,
    /// Window within which a push is matched against an existing entry.
    pub dedup_window_ms: i64,
    /// Buffer size of the UI event broadcast channel.
    pub event_capacity: usize,
    /// Per-request timeout for the HTTP fallback.
    pub http_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            http_base_url: DEFAULT_HTTP_BASE_URL.to_string(),
            max_retries: 5,
            reconnect_interval_ms: 3_000,
            request_timeout_ms: 5_000,
            dedup_window_ms: 5_000,
            event_capacity: 256,
            http_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(SyncError::Config("endpoint must not be empty".into()));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(SyncError::Config("reconnect_interval_ms must be > 0".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(SyncError::Config("request_timeout_ms must be > 0".into()));
        }
        if self.dedup_window_ms <= 0 {
            return Err(SyncError::Config("dedup_window_ms must be > 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config("event_capacity must be > 0".into()));
        }
        Ok(())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn http_fallback_enabled(&self) -> bool {
        !self.http_base_url.trim().is_empty()
    }
}
