//! WebSocket connector over tokio-tungstenite.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{redacted, Connector, Duplex, WireMessage, CLOSE_ABNORMAL};
use crate::error::{Result, SyncError};

/// Opens `ws://` / `wss://` connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Duplex>> {
        let url = url.clone();
        Box::pin(async move {
            let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| SyncError::ConnectionRefused {
                    url: redacted(&url),
                    detail: e.to_string(),
                })?;

            let (mut sink, stream) = stream.split();
            let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();

            // Writer: drains the outbound queue until a close is written or
            // the session drops its sender.
            tokio::spawn(async move {
                while let Some(msg) = outbound_rx.recv().await {
                    let closing = matches!(msg, WireMessage::Close { .. });
                    if let Err(e) = sink.send(to_ws(msg)).await {
                        tracing::debug!(error = %e, "websocket write failed");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            let inbound = stream
                .filter_map(|item| async move {
                    match item {
                        Ok(msg) => from_ws(msg),
                        Err(e) => Some(WireMessage::Close {
                            code: CLOSE_ABNORMAL,
                            reason: e.to_string(),
                        }),
                    }
                })
                .boxed();

            Ok(Duplex { outbound, inbound })
        })
    }
}

fn to_ws(msg: WireMessage) -> WsMessage {
    match msg {
        WireMessage::Text(text) => WsMessage::Text(text),
        WireMessage::Binary(bytes) => WsMessage::Binary(bytes),
        WireMessage::Close { code, reason } => WsMessage::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

/// Control frames are handled by tungstenite and never surface.
fn from_ws(msg: WsMessage) -> Option<WireMessage> {
    match msg {
        WsMessage::Text(text) => Some(WireMessage::Text(text)),
        WsMessage::Binary(bytes) => Some(WireMessage::Binary(bytes)),
        WsMessage::Close(frame) => Some(match frame {
            Some(frame) => WireMessage::Close {
                code: u16::from(frame.code),
                reason: frame.reason.into_owned(),
            },
            // A close without a status code carries no status (1005); it is
            // still not a normal closure.
            None => WireMessage::Close {
                code: 1005,
                reason: String::new(),
            },
        }),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CLOSE_NORMAL;

    #[test]
    fn test_close_round_trips_code() {
        let ws = to_ws(WireMessage::normal_close("bye"));
        assert_eq!(
            from_ws(ws),
            Some(WireMessage::Close { code: CLOSE_NORMAL, reason: "bye".into() })
        );
    }

    #[test]
    fn test_control_frames_are_filtered() {
        assert_eq!(from_ws(WsMessage::Ping(vec![1])), None);
        assert_eq!(from_ws(WsMessage::Pong(vec![1])), None);
    }

    #[test]
    fn test_close_without_frame_is_not_normal() {
        match from_ws(WsMessage::Close(None)) {
            Some(WireMessage::Close { code, .. }) => assert_ne!(code, CLOSE_NORMAL),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_refused() {
        let url = Url::parse("ws://127.0.0.1:1/ws?token=secret").unwrap();
        let err = WsConnector.connect(&url).await.unwrap_err();
        match err {
            SyncError::ConnectionRefused { url, .. } => assert!(!url.contains("secret")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
