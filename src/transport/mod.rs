//! # Transport
//!
//! The duplex socket seam. A [`Connector`] opens one [`Duplex`] per call;
//! the session task owns at most one open duplex at a time.
//!
//! - [`ws::WsConnector`]: tokio-tungstenite, used in production.
//! - [`memory::MemoryConnector`]: in-process pair of channels, used by tests
//!   and embedders that want to drive the session without a socket.
//!
//! ## Closure semantics
//! - Close code `1000` is a normal closure: no reconnect.
//! - Any other code, a stream that ends without a close frame, or a failed
//!   open is abnormal: [`ReconnectPolicy`] decides whether to try again.

pub mod memory;
pub mod ws;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use reqwest::Url;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Connection lost without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// One message on the duplex, after websocket framing is stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

impl WireMessage {
    pub fn normal_close(reason: impl Into<String>) -> Self {
        WireMessage::Close {
            code: CLOSE_NORMAL,
            reason: reason.into(),
        }
    }
}

/// An open duplex channel.
///
/// Dropping `outbound` lets the writer side finish; `inbound` ending without
/// a [`WireMessage::Close`] is treated as an abnormal drop.
pub struct Duplex {
    pub outbound: mpsc::UnboundedSender<WireMessage>,
    pub inbound: BoxStream<'static, WireMessage>,
}

impl std::fmt::Debug for Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex")
            .field("outbound_closed", &self.outbound.is_closed())
            .finish_non_exhaustive()
    }
}

/// Opens duplex channels.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Duplex>>;
}

/// Lifecycle of the single process-wide connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

// ---------------------------------------------------------------------------
// Credential and endpoint
// ---------------------------------------------------------------------------

/// Session token presented during the handshake. `Debug` never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Append the credential to `endpoint` as the `token` query parameter.
pub fn endpoint_url(endpoint: &str, credential: &Credential) -> Result<Url> {
    Url::parse_with_params(endpoint, &[("token", credential.expose())])
        .map_err(|e| SyncError::Config(format!("invalid endpoint {endpoint:?}: {e}")))
}

/// `url` without its query string, safe to log.
pub fn redacted(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}

// ---------------------------------------------------------------------------
// Reconnect policy
// ---------------------------------------------------------------------------

/// What to do after the connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Code 1000: stay down, clear the active channel marker.
    Normal,
    /// Schedule attempt number `attempt` after `delay`.
    Reconnect { attempt: u32, delay: Duration },
    /// Retry budget spent; stay down until an explicit connect.
    Exhausted,
    /// The user disconnected; never reconnect.
    Suppressed,
}

/// Fixed-interval, bounded-count reconnect policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_retries: u32,
    interval: Duration,
    retries: u32,
    suppressed: bool,
}

impl ReconnectPolicy {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
            retries: 0,
            suppressed: false,
        }
    }

    /// Reconnect attempts made since the last reset.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Explicit connect: fresh budget, auto-reconnect allowed again.
    pub fn reset(&mut self) {
        self.retries = 0;
        self.suppressed = false;
    }

    /// The connection opened successfully.
    pub fn on_open(&mut self) {
        self.retries = 0;
    }

    /// User-initiated disconnect: no reconnect until the next explicit connect.
    pub fn suppress(&mut self) {
        self.suppressed = true;
    }

    pub fn on_close(&mut self, code: u16) -> CloseDecision {
        if self.suppressed {
            return CloseDecision::Suppressed;
        }
        if code == CLOSE_NORMAL {
            return CloseDecision::Normal;
        }
        if self.retries >= self.max_retries {
            return CloseDecision::Exhausted;
        }
        self.retries += 1;
        CloseDecision::Reconnect {
            attempt: self.retries,
            delay: self.interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(5, Duration::from_millis(3_000))
    }

    #[test]
    fn test_abnormal_close_schedules_fixed_interval() {
        let mut p = policy();
        assert_eq!(
            p.on_close(CLOSE_ABNORMAL),
            CloseDecision::Reconnect { attempt: 1, delay: Duration::from_millis(3_000) }
        );
        assert_eq!(
            p.on_close(4001),
            CloseDecision::Reconnect { attempt: 2, delay: Duration::from_millis(3_000) }
        );
    }

    #[test]
    fn test_retries_bounded_at_max() {
        let mut p = policy();
        for expected in 1..=5 {
            match p.on_close(CLOSE_ABNORMAL) {
                CloseDecision::Reconnect { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("attempt {expected}: unexpected {other:?}"),
            }
        }
        assert_eq!(p.on_close(CLOSE_ABNORMAL), CloseDecision::Exhausted);
        assert_eq!(p.on_close(CLOSE_ABNORMAL), CloseDecision::Exhausted);
        assert_eq!(p.retries(), 5);
    }

    #[test]
    fn test_normal_close_never_reconnects() {
        let mut p = policy();
        assert_eq!(p.on_close(CLOSE_NORMAL), CloseDecision::Normal);
        assert_eq!(p.retries(), 0);
    }

    #[test]
    fn test_open_resets_budget() {
        let mut p = policy();
        p.on_close(CLOSE_ABNORMAL);
        p.on_close(CLOSE_ABNORMAL);
        p.on_open();
        assert_eq!(p.retries(), 0);
    }

    #[test]
    fn test_suppressed_until_reset() {
        let mut p = policy();
        p.suppress();
        assert_eq!(p.on_close(CLOSE_ABNORMAL), CloseDecision::Suppressed);
        p.reset();
        assert!(!p.is_suppressed());
        assert!(matches!(p.on_close(CLOSE_ABNORMAL), CloseDecision::Reconnect { .. }));
    }

    #[test]
    fn test_endpoint_url_encodes_token() {
        let url = endpoint_url("ws://localhost:8080/ws", &Credential::new("a b&c")).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/ws?token=a+b%26c");
        assert_eq!(redacted(&url), "ws://localhost:8080/ws");
    }

    #[test]
    fn test_endpoint_url_rejects_garbage() {
        assert!(matches!(
            endpoint_url("not a url", &Credential::new("t")),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let shown = format!("{:?}", Credential::new("secret-token"));
        assert!(!shown.contains("secret-token"));
    }
}
