//! Wire protocol: identifiers, the timeline `Message`, and JSON text frames.
//!
//! ## Frames
//! Every frame is a JSON object with a `type` tag.
//!
//! | Direction | type                      | body                                                   |
//! |-----------|---------------------------|--------------------------------------------------------|
//! | out       | `JOIN_CHANNEL`            | `{ channelId }`                                        |
//! | out       | `LEAVE_CHANNEL`           | `{ channelId }`                                        |
//! | out       | `CHANNEL_MESSAGE`         | `{ channelId, payload: { content, attachmentIds } }`   |
//! | out       | `FETCH_MESSAGES`          | `{ channelId }`                                        |
//! | in        | `CHANNEL_MESSAGE`         | `{ channelId, userId, username, payload, timestamp }`  |
//! | in        | `FETCH_MESSAGES_RESPONSE` | `{ channelId, messages: [...] }` newest-first          |
//! | in        | `ERROR`                   | `{ message }`                                          |
//!
//! Ids arrive as either JSON strings or numbers; they are normalized to
//! strings so `1` and `"1"` compare equal.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, SyncError};

pub const TYPE_JOIN_CHANNEL: &str = "JOIN_CHANNEL";
pub const TYPE_LEAVE_CHANNEL: &str = "LEAVE_CHANNEL";
pub const TYPE_CHANNEL_MESSAGE: &str = "CHANNEL_MESSAGE";
pub const TYPE_FETCH_MESSAGES: &str = "FETCH_MESSAGES";
pub const TYPE_FETCH_MESSAGES_RESPONSE: &str = "FETCH_MESSAGES_RESPONSE";
pub const TYPE_ERROR: &str = "ERROR";

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<u64> for $name {
            fn from(n: u64) -> Self {
                Self(n.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
                string_or_number(d).map(Self)
            }
        }
    };
}

string_id!(
    /// Channel identifier.
    ChannelId
);
string_id!(
    /// User identifier of a message sender.
    UserId
);
string_id!(
    /// Message identifier: server-assigned, derived from history position,
    /// or generated locally for optimistic entries.
    MessageId
);

impl MessageId {
    /// Fresh identifier for a locally originated message.
    pub fn local() -> Self {
        Self(format!("local-{}", uuid::Uuid::new_v4()))
    }

    /// Positional id for a history entry that carries none on the wire.
    pub fn for_history(channel_id: &ChannelId, index: usize) -> Self {
        Self(format!("msg-{channel_id}-{index}"))
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Uint(u64),
    }

    match Raw::deserialize(d)? {
        Raw::Text(s) => Ok(s),
        Raw::Int(n) => Ok(n.to_string()),
        Raw::Uint(n) => Ok(n.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Timeline message
// ---------------------------------------------------------------------------

/// Whether a timeline entry has been echoed back by the server yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Optimistic,
    Confirmed,
}

/// Who sent a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Absent for history entries, which only carry a display name.
    pub user_id: Option<UserId>,
    pub display_name: String,
}

impl Sender {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            display_name: display_name.into(),
        }
    }
}

/// One entry in a channel timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender: Sender,
    pub body: String,
    /// Creation time reported by the server (or local send time).
    pub created_at_ms: i64,
    /// Local clock when this entry reached the client. Dedup compares this.
    pub received_at_ms: i64,
    pub provenance: Provenance,
    pub flagged: bool,
}

impl Message {
    /// Build a locally originated, not yet confirmed message.
    pub fn optimistic(
        channel_id: ChannelId,
        sender: Sender,
        body: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            id: MessageId::local(),
            channel_id,
            sender,
            body: body.into(),
            created_at_ms: now_ms,
            received_at_ms: now_ms,
            provenance: Provenance::Optimistic,
            flagged: false,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.provenance == Provenance::Optimistic
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// A timestamp as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

impl WireTimestamp {
    /// Epoch milliseconds, or `None` when the text form is unparseable.
    pub fn to_millis(&self) -> Option<i64> {
        match self {
            WireTimestamp::Millis(ms) => Some(*ms),
            WireTimestamp::Fractional(ms) if ms.is_finite() => Some(*ms as i64),
            WireTimestamp::Fractional(_) => None,
            WireTimestamp::Text(s) => parse_timestamp(s),
        }
    }
}

/// Parse RFC 3339, zone-less ISO date-times (taken as UTC) or a numeric string.
pub fn parse_timestamp(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    s.parse::<i64>().ok()
}

fn resolve_timestamp(ts: Option<&WireTimestamp>, fallback_ms: i64) -> i64 {
    match ts {
        Some(ts) => ts.to_millis().unwrap_or_else(|| {
            tracing::debug!(timestamp = ?ts, "unparseable timestamp, using arrival time");
            fallback_ms
        }),
        None => fallback_ms,
    }
}

// ---------------------------------------------------------------------------
// Outbound frames
// ---------------------------------------------------------------------------

/// Body of an outgoing chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingPayload {
    pub content: String,
    pub attachment_ids: Vec<String>,
}

/// A frame written by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum OutboundFrame {
    JoinChannel {
        channel_id: ChannelId,
    },
    LeaveChannel {
        channel_id: ChannelId,
    },
    ChannelMessage {
        channel_id: ChannelId,
        payload: OutgoingPayload,
    },
    FetchMessages {
        channel_id: ChannelId,
    },
}

impl OutboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::JoinChannel { .. } => TYPE_JOIN_CHANNEL,
            OutboundFrame::LeaveChannel { .. } => TYPE_LEAVE_CHANNEL,
            OutboundFrame::ChannelMessage { .. } => TYPE_CHANNEL_MESSAGE,
            OutboundFrame::FetchMessages { .. } => TYPE_FETCH_MESSAGES,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        match self {
            OutboundFrame::JoinChannel { channel_id }
            | OutboundFrame::LeaveChannel { channel_id }
            | OutboundFrame::ChannelMessage { channel_id, .. }
            | OutboundFrame::FetchMessages { channel_id } => channel_id,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub content: String,
}

/// A `CHANNEL_MESSAGE` pushed by the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushedMessage {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub payload: Option<PushPayload>,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
}

impl PushedMessage {
    /// Convert to a confirmed timeline entry that arrived at `received_at_ms`.
    pub fn into_message(self, received_at_ms: i64) -> Message {
        let display_name = match (&self.username, &self.user_id) {
            (Some(name), _) => name.clone(),
            (None, Some(uid)) => format!("User {uid}"),
            (None, None) => "Unknown".to_string(),
        };
        let created_at_ms = resolve_timestamp(self.timestamp.as_ref(), received_at_ms);
        Message {
            id: self
                .id
                .unwrap_or_else(|| MessageId::from(uuid::Uuid::new_v4().to_string())),
            channel_id: self.channel_id,
            sender: Sender {
                user_id: self.user_id,
                display_name,
            },
            body: self.payload.map(|p| p.content).unwrap_or_default(),
            created_at_ms,
            received_at_ms,
            provenance: Provenance::Confirmed,
            flagged: false,
        }
    }
}

/// One entry of a history batch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
}

/// A `FETCH_MESSAGES_RESPONSE`: newest-first history for one channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryBatch {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub messages: Vec<HistoryEntry>,
}

impl HistoryBatch {
    /// Map to confirmed messages in chronological (oldest-first) order.
    ///
    /// Ids are assigned from the position in the newest-first wire batch.
    pub fn into_timeline(self, received_at_ms: i64) -> Vec<Message> {
        let channel_id = self.channel_id;
        let mut timeline: Vec<Message> = self
            .messages
            .into_iter()
            .enumerate()
            .map(|(index, entry)| Message {
                id: MessageId::for_history(&channel_id, index),
                channel_id: channel_id.clone(),
                sender: Sender {
                    user_id: None,
                    display_name: entry.username.unwrap_or_else(|| "Unknown".to_string()),
                },
                body: entry.content,
                created_at_ms: resolve_timestamp(entry.timestamp.as_ref(), received_at_ms),
                received_at_ms,
                provenance: Provenance::Confirmed,
                flagged: false,
            })
            .collect();
        timeline.reverse();
        timeline
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    ChannelMessage(PushedMessage),
    FetchMessagesResponse(HistoryBatch),
    Error { message: String },
    /// Any tag the core does not consume; routed to extension handlers.
    Other { kind: String, body: serde_json::Value },
}

impl InboundFrame {
    pub fn kind(&self) -> &str {
        match self {
            InboundFrame::ChannelMessage(_) => TYPE_CHANNEL_MESSAGE,
            InboundFrame::FetchMessagesResponse(_) => TYPE_FETCH_MESSAGES_RESPONSE,
            InboundFrame::Error { .. } => TYPE_ERROR,
            InboundFrame::Other { kind, .. } => kind,
        }
    }
}

/// Decode one text frame.
pub fn decode_inbound(text: &str) -> Result<InboundFrame> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| SyncError::Malformed("frame has no string `type` tag".to_string()))?
        .to_string();

    let frame = match kind.as_str() {
        TYPE_CHANNEL_MESSAGE => InboundFrame::ChannelMessage(serde_json::from_value(value)?),
        TYPE_FETCH_MESSAGES_RESPONSE => {
            InboundFrame::FetchMessagesResponse(serde_json::from_value(value)?)
        }
        TYPE_ERROR => {
            let message = match value.get("message") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "unspecified server error".to_string(),
            };
            InboundFrame::Error { message }
        }
        _ => InboundFrame::Other { kind, body: value },
    };
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_join_frame_wire_shape() {
        let frame = OutboundFrame::JoinChannel { channel_id: "c1".into() };
        let v: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(v, json!({"type": "JOIN_CHANNEL", "channelId": "c1"}));
    }

    #[test]
    fn test_channel_message_frame_wire_shape() {
        let frame = OutboundFrame::ChannelMessage {
            channel_id: "c1".into(),
            payload: OutgoingPayload {
                content: "hello".into(),
                attachment_ids: vec!["a9".into()],
            },
        };
        let v: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "CHANNEL_MESSAGE",
                "channelId": "c1",
                "payload": {"content": "hello", "attachmentIds": ["a9"]}
            })
        );
    }

    #[test]
    fn test_fetch_and_leave_tags() {
        let fetch = OutboundFrame::FetchMessages { channel_id: "c3".into() };
        let leave = OutboundFrame::LeaveChannel { channel_id: "c3".into() };
        assert!(fetch.encode().unwrap().contains("\"type\":\"FETCH_MESSAGES\""));
        assert!(leave.encode().unwrap().contains("\"type\":\"LEAVE_CHANNEL\""));
        assert_eq!(fetch.kind(), TYPE_FETCH_MESSAGES);
        assert_eq!(leave.channel_id().as_str(), "c3");
    }

    #[test]
    fn test_numeric_ids_normalize_to_strings() {
        let text = r#"{"type":"CHANNEL_MESSAGE","channelId":7,"userId":1,"payload":{"content":"x"}}"#;
        match decode_inbound(text).unwrap() {
            InboundFrame::ChannelMessage(m) => {
                assert_eq!(m.channel_id, ChannelId::from("7"));
                assert_eq!(m.user_id, Some(UserId::from("1")));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_push_without_username_names_by_user_id() {
        let push: PushedMessage = serde_json::from_value(json!({
            "channelId": "c1", "userId": 42, "payload": {"content": "hi"}
        }))
        .unwrap();
        let msg = push.into_message(1_000);
        assert_eq!(msg.sender.display_name, "User 42");
        assert_eq!(msg.created_at_ms, 1_000);
        assert_eq!(msg.provenance, Provenance::Confirmed);
    }

    #[test]
    fn test_push_without_sender_is_unknown() {
        let push: PushedMessage =
            serde_json::from_value(json!({"channelId": "c1", "payload": {"content": "hi"}})).unwrap();
        assert_eq!(push.into_message(0).sender.display_name, "Unknown");
    }

    #[test]
    fn test_history_batch_reversed_to_oldest_first() {
        let batch: HistoryBatch = serde_json::from_value(json!({
            "channelId": "c1",
            "messages": [
                {"username": "bob", "content": "b", "timestamp": 200},
                {"username": "amy", "content": "a", "timestamp": 100}
            ]
        }))
        .unwrap();
        let timeline = batch.into_timeline(5_000);
        let bodies: Vec<&str> = timeline.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["a", "b"]);
        assert_eq!(timeline[0].id, MessageId::from("msg-c1-1"));
        assert_eq!(timeline[1].id, MessageId::from("msg-c1-0"));
        assert_eq!(timeline[0].created_at_ms, 100);
    }

    #[test]
    fn test_history_entry_without_username() {
        let batch: HistoryBatch = serde_json::from_value(json!({
            "channelId": "c1", "messages": [{"content": "x"}]
        }))
        .unwrap();
        assert_eq!(batch.into_timeline(0)[0].sender.display_name, "Unknown");
    }

    #[test]
    fn test_history_response_without_messages_is_empty() {
        let text = r#"{"type":"FETCH_MESSAGES_RESPONSE","channelId":"c1"}"#;
        match decode_inbound(text).unwrap() {
            InboundFrame::FetchMessagesResponse(b) => assert!(b.messages.is_empty()),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[rstest]
    #[case("not json at all")]
    #[case("[1,2,3]")]
    #[case(r#"{"channelId":"c1"}"#)]
    #[case(r#"{"type":42}"#)]
    #[case(r#"{"type":"CHANNEL_MESSAGE"}"#)]
    fn test_malformed_frames_rejected(#[case] text: &str) {
        assert!(matches!(decode_inbound(text), Err(SyncError::Malformed(_))));
    }

    #[rstest]
    #[case(r#"{"type":"ERROR","message":"denied"}"#, "denied")]
    #[case(r#"{"type":"ERROR"}"#, "unspecified server error")]
    #[case(r#"{"type":"ERROR","message":{"code":3}}"#, r#"{"code":3}"#)]
    fn test_error_frame_message(#[case] text: &str, #[case] expected: &str) {
        assert_eq!(
            decode_inbound(text).unwrap(),
            InboundFrame::Error { message: expected.to_string() }
        );
    }

    #[test]
    fn test_unknown_type_is_other() {
        let frame = decode_inbound(r#"{"type":"TYPING","userId":3}"#).unwrap();
        assert_eq!(frame.kind(), "TYPING");
        assert!(matches!(frame, InboundFrame::Other { .. }));
    }

    #[rstest]
    #[case("1970-01-01T00:00:01Z", Some(1_000))]
    #[case("1970-01-01T00:00:01.500+00:00", Some(1_500))]
    #[case("1970-01-01T00:00:02", Some(2_000))]
    #[case("1970-01-01 00:00:02.250", Some(2_250))]
    #[case("1700000000000", Some(1_700_000_000_000))]
    #[case("yesterday", None)]
    fn test_parse_timestamp(#[case] input: &str, #[case] expected: Option<i64>) {
        assert_eq!(parse_timestamp(input), expected);
    }

    #[test]
    fn test_local_ids_are_unique() {
        assert_ne!(MessageId::local(), MessageId::local());
        assert!(MessageId::local().as_str().starts_with("local-"));
    }
}
