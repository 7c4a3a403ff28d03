//! HTTP history fallback.
//!
//! Used when the duplex fetch is unavailable: `GET {base}/api/messages/{channelId}`
//! with a bearer credential. The endpoint returns stored messages newest-first,
//! exactly like the duplex response, so the same reversal applies.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::protocol::{ChannelId, Message, MessageId, Provenance, Sender, UserId, WireTimestamp};
use crate::transport::Credential;

/// A persisted message as served by the REST API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub sender_user_id: Option<UserId>,
    #[serde(default)]
    pub sender_user_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<WireTimestamp>,
}

/// Map a newest-first REST batch to an oldest-first timeline.
pub fn stored_to_timeline(
    channel_id: &ChannelId,
    stored: Vec<StoredMessage>,
    received_at_ms: i64,
) -> Vec<Message> {
    let mut timeline: Vec<Message> = stored
        .into_iter()
        .enumerate()
        .map(|(index, m)| {
            let display_name = m
                .sender_user_name
                .or(m.username)
                .unwrap_or_else(|| match &m.sender_user_id {
                    Some(uid) => format!("User {uid}"),
                    None => "Unknown".to_string(),
                });
            Message {
                id: m
                    .id
                    .unwrap_or_else(|| MessageId::for_history(channel_id, index)),
                channel_id: channel_id.clone(),
                sender: Sender {
                    user_id: m.sender_user_id,
                    display_name,
                },
                body: m.content,
                created_at_ms: m
                    .created_at
                    .as_ref()
                    .and_then(WireTimestamp::to_millis)
                    .unwrap_or(received_at_ms),
                received_at_ms,
                provenance: Provenance::Confirmed,
                flagged: false,
            }
        })
        .collect();
    timeline.reverse();
    timeline
}

/// REST client for channel history.
#[derive(Debug, Clone)]
pub struct HttpHistory {
    base_url: String,
    client: reqwest::Client,
}

impl HttpHistory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        // Builder failure only happens in broken TLS environments; fall back
        // to a default client rather than failing session start.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn url_for(&self, channel_id: &ChannelId) -> String {
        format!("{}/api/messages/{}", self.base_url, channel_id)
    }

    /// Fetch a channel's history, oldest first.
    pub async fn fetch(&self, channel_id: &ChannelId, credential: &Credential) -> Result<Vec<Message>> {
        let url = self.url_for(channel_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(credential.expose())
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("GET {url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(SyncError::Http {
                status: resp.status().as_u16(),
                url,
            });
        }

        let stored: Vec<StoredMessage> = resp
            .json()
            .await
            .map_err(|e| SyncError::Malformed(format!("history body from {url}: {e}")))?;
        tracing::debug!(channel_id = %channel_id, count = stored.len(), "history fetched over HTTP");
        Ok(stored_to_timeline(channel_id, stored, crate::protocol::now_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server: answers the first request with `status` and
    /// `body`, and hands back the raw request text.
    async fn serve_once(status: &'static str, body: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let resp = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (base, handle)
    }

    #[test]
    fn test_stored_messages_reversed_and_named() {
        let stored: Vec<StoredMessage> = serde_json::from_value(json!([
            {"id": 12, "senderUserId": 3, "content": "newer", "createdAt": "1970-01-01T00:00:02"},
            {"id": 11, "senderUserName": "amy", "senderUserId": 1, "content": "older", "createdAt": 1000}
        ]))
        .unwrap();
        let t = stored_to_timeline(&"c1".into(), stored, 99);
        assert_eq!(t[0].body, "older");
        assert_eq!(t[0].sender.display_name, "amy");
        assert_eq!(t[0].id.as_str(), "11");
        assert_eq!(t[0].created_at_ms, 1_000);
        assert_eq!(t[1].sender.display_name, "User 3");
        assert_eq!(t[1].created_at_ms, 2_000);
        assert!(t.iter().all(|m| m.provenance == Provenance::Confirmed));
    }

    #[test]
    fn test_missing_id_gets_positional_id() {
        let stored: Vec<StoredMessage> =
            serde_json::from_value(json!([{"username": "bob", "content": "x"}])).unwrap();
        let t = stored_to_timeline(&"c9".into(), stored, 5);
        assert_eq!(t[0].id.as_str(), "msg-c9-0");
        assert_eq!(t[0].sender.display_name, "bob");
        assert_eq!(t[0].created_at_ms, 5);
    }

    #[test]
    fn test_url_for_trims_trailing_slash() {
        let h = HttpHistory::new("http://localhost:8080/", Duration::from_secs(1));
        assert_eq!(h.url_for(&"42".into()), "http://localhost:8080/api/messages/42");
    }

    #[tokio::test]
    async fn test_fetch_sends_bearer_and_maps_body() {
        let body = json!([
            {"id": 2, "username": "bob", "content": "b"},
            {"id": 1, "username": "amy", "content": "a"}
        ])
        .to_string();
        let (base, server) = serve_once("200 OK", body).await;
        let h = HttpHistory::new(base, Duration::from_secs(5));

        let t = h.fetch(&"c1".into(), &Credential::new("tok1")).await.unwrap();
        let bodies: Vec<&str> = t.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["a", "b"]);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/messages/c1 "));
        assert!(request.to_lowercase().contains("authorization: bearer tok1"));
    }

    #[tokio::test]
    async fn test_fetch_non_success_status() {
        let (base, _server) = serve_once("500 Internal Server Error", "{}".to_string()).await;
        let h = HttpHistory::new(base, Duration::from_secs(5));
        match h.fetch(&"c1".into(), &Credential::new("t")).await {
            Err(SyncError::Http { status, url }) => {
                assert_eq!(status, 500);
                assert!(url.ends_with("/api/messages/c1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
