//! In-process connector.
//!
//! Each successful `connect` hands the far end of the duplex to a
//! [`MemoryListener`] as a [`ServerEnd`], which plays the server: it reads
//! what the client wrote and pushes frames back.

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use reqwest::Url;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{redacted, Connector, Duplex, WireMessage};
use crate::error::{Result, SyncError};

#[derive(Debug, Default)]
struct Shared {
    attempts: AtomicUsize,
    refusing: AtomicBool,
    urls: Mutex<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

/// Receives the server side of every accepted connection.
#[derive(Debug)]
pub struct MemoryListener {
    accepted: mpsc::UnboundedReceiver<ServerEnd>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryListener) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: Arc::new(Shared::default()),
                accepted,
            },
            MemoryListener { accepted: rx },
        )
    }

    /// While set, every `connect` fails as if the server were down.
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Total `connect` calls, refused ones included.
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Every URL `connect` was called with, in order.
    pub fn urls(&self) -> Vec<String> {
        self.shared
            .urls
            .lock()
            .map(|urls| urls.clone())
            .unwrap_or_default()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Duplex>> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut urls) = self.shared.urls.lock() {
            urls.push(url.to_string());
        }

        let result = if self.shared.refusing.load(Ordering::SeqCst) {
            Err(SyncError::ConnectionRefused {
                url: redacted(url),
                detail: "connection refused".to_string(),
            })
        } else {
            let (client_tx, client_rx) = mpsc::unbounded_channel();
            let (server_tx, server_rx) = mpsc::unbounded_channel();
            let server = ServerEnd {
                url: url.to_string(),
                from_client: client_rx,
                to_client: Some(server_tx),
            };
            match self.accepted.send(server) {
                Ok(()) => Ok(Duplex {
                    outbound: client_tx,
                    inbound: UnboundedReceiverStream::new(server_rx).boxed(),
                }),
                Err(_) => Err(SyncError::ConnectionRefused {
                    url: redacted(url),
                    detail: "listener dropped".to_string(),
                }),
            }
        };
        Box::pin(async move { result })
    }
}

impl MemoryListener {
    /// Next accepted connection, or `None` once every connector is gone.
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.accepted.recv().await
    }

    pub fn try_accept(&mut self) -> Option<ServerEnd> {
        self.accepted.try_recv().ok()
    }
}

/// Server side of one in-memory connection.
#[derive(Debug)]
pub struct ServerEnd {
    pub url: String,
    from_client: mpsc::UnboundedReceiver<WireMessage>,
    to_client: Option<mpsc::UnboundedSender<WireMessage>>,
}

impl ServerEnd {
    /// Next message written by the client.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WireMessage> {
        self.from_client.try_recv().ok()
    }

    /// Next text frame from the client, parsed as JSON. Non-text messages
    /// are skipped.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        while let Some(msg) = self.recv().await {
            if let WireMessage::Text(text) = msg {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    }

    /// Drain everything the client has written so far.
    pub fn drain_json(&mut self) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Some(msg) = self.try_recv() {
            if let WireMessage::Text(text) = msg {
                if let Ok(v) = serde_json::from_str(&text) {
                    out.push(v);
                }
            }
        }
        out
    }

    pub fn send(&self, msg: WireMessage) -> bool {
        self.to_client
            .as_ref()
            .map(|tx| tx.send(msg).is_ok())
            .unwrap_or(false)
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(WireMessage::Text(text.into()))
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Send a close frame with `code`, then stop sending.
    pub fn close(&mut self, code: u16) {
        self.send(WireMessage::Close {
            code,
            reason: String::new(),
        });
        self.to_client = None;
    }

    /// End the stream with no close frame, like a dropped TCP connection.
    pub fn drop_connection(&mut self) {
        self.to_client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("ws://memory/ws?token=t").unwrap()
    }

    #[tokio::test]
    async fn test_connect_hands_server_end_to_listener() {
        let (connector, mut listener) = MemoryConnector::new();
        let mut duplex = connector.connect(&url()).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        duplex.outbound.send(WireMessage::Text("{\"a\":1}".into())).unwrap();
        assert_eq!(server.recv_json().await, Some(serde_json::json!({"a": 1})));

        assert!(server.send_text("pong"));
        assert_eq!(duplex.inbound.next().await, Some(WireMessage::Text("pong".into())));
    }

    #[tokio::test]
    async fn test_refusing_counts_attempts() {
        let (connector, mut listener) = MemoryConnector::new();
        connector.set_refusing(true);
        assert!(connector.connect(&url()).await.is_err());
        assert!(connector.connect(&url()).await.is_err());
        assert_eq!(connector.attempts(), 2);
        assert!(listener.try_accept().is_none());
    }

    #[tokio::test]
    async fn test_drop_connection_ends_stream() {
        let (connector, mut listener) = MemoryConnector::new();
        let mut duplex = connector.connect(&url()).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        server.drop_connection();
        assert_eq!(duplex.inbound.next().await, None);
    }
}
