// Wire format for the chat socket
// Outbound frames are tagged by `action`, inbound frames by `type`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::debug;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{ChatError, ChatResult};
use crate::models::{Attachment, AttachmentKind, ConversationSummary, SharedReference};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutboundFrame {
    SendMessage(SendMessageFrame),
    MarkRead {
        request_id: String,
        conversation_id: String,
        message_id: String,
    },
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
    JoinConversation {
        conversation_id: String,
    },
    LeaveConversation {
        conversation_id: String,
    },
    GetPresence {
        conversation_id: String,
    },
    GetInbox {
        request_id: String,
    },
    DeleteMessage {
        request_id: String,
        conversation_id: String,
        message_id: String,
    },
    Ping,
}

impl OutboundFrame {
    pub fn action(&self) -> &'static str {
        match self {
            OutboundFrame::SendMessage(_) => "send_message",
            OutboundFrame::MarkRead { .. } => "mark_read",
            OutboundFrame::Typing { .. } => "typing",
            OutboundFrame::JoinConversation { .. } => "join_conversation",
            OutboundFrame::LeaveConversation { .. } => "leave_conversation",
            OutboundFrame::GetPresence { .. } => "get_presence",
            OutboundFrame::GetInbox { .. } => "get_inbox",
            OutboundFrame::DeleteMessage { .. } => "delete_message",
            OutboundFrame::Ping => "ping",
        }
    }

    pub fn encode(&self) -> ChatResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `send_message` payload. Attachment fields are flattened onto the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageFrame {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_kind: Option<AttachmentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_reference: Option<SharedReference>,
}

impl SendMessageFrame {
    pub fn with_attachment(mut self, attachment: &Attachment) -> Self {
        self.attachment_url = Some(attachment.url.clone());
        self.attachment_kind = Some(attachment.kind);
        self.attachment_size = Some(attachment.size);
        self.attachment_name = Some(attachment.name.clone());
        self
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Subscription key for the dispatcher, one per inbound `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ack,
    MessageSent,
    Typing,
    ReadReceiptUpdated,
    MessageDeleted,
    PresenceStatus,
    PresenceUpdated,
    InboxUpdated,
    Pong,
    Notification,
    /// Frames without a recognised `type`.
    Fallback,
}

impl EventKind {
    pub fn from_wire(name: &str) -> Option<EventKind> {
        match name {
            "ack" => Some(EventKind::Ack),
            "message.sent" => Some(EventKind::MessageSent),
            "typing" => Some(EventKind::Typing),
            "read_receipt.updated" => Some(EventKind::ReadReceiptUpdated),
            "message.deleted" => Some(EventKind::MessageDeleted),
            "presence.status" => Some(EventKind::PresenceStatus),
            "presence.updated" => Some(EventKind::PresenceUpdated),
            "inbox.updated" => Some(EventKind::InboxUpdated),
            "pong" => Some(EventKind::Pong),
            "notification" => Some(EventKind::Notification),
            _ => None,
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            EventKind::Ack => "ack",
            EventKind::MessageSent => "message.sent",
            EventKind::Typing => "typing",
            EventKind::ReadReceiptUpdated => "read_receipt.updated",
            EventKind::MessageDeleted => "message.deleted",
            EventKind::PresenceStatus => "presence.status",
            EventKind::PresenceUpdated => "presence.updated",
            EventKind::InboxUpdated => "inbox.updated",
            EventKind::Pong => "pong",
            EventKind::Notification => "notification",
            EventKind::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Ack(Ack),
    MessageSent(MessageSentEvent),
    Typing(TypingEvent),
    ReadReceiptUpdated(ReadReceiptEvent),
    MessageDeleted(MessageDeletedEvent),
    PresenceStatus(PresenceSnapshot),
    PresenceUpdated(PresenceDelta),
    InboxUpdated(InboxEvent),
    Pong(Value),
    Notification(Value),
    Fallback(Value),
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::Ack(_) => EventKind::Ack,
            InboundEvent::MessageSent(_) => EventKind::MessageSent,
            InboundEvent::Typing(_) => EventKind::Typing,
            InboundEvent::ReadReceiptUpdated(_) => EventKind::ReadReceiptUpdated,
            InboundEvent::MessageDeleted(_) => EventKind::MessageDeleted,
            InboundEvent::PresenceStatus(_) => EventKind::PresenceStatus,
            InboundEvent::PresenceUpdated(_) => EventKind::PresenceUpdated,
            InboundEvent::InboxUpdated(_) => EventKind::InboxUpdated,
            InboundEvent::Pong(_) => EventKind::Pong,
            InboundEvent::Notification(_) => EventKind::Notification,
            InboundEvent::Fallback(_) => EventKind::Fallback,
        }
    }
}

// Typed frames that go through serde; pong/notification/fallback stay raw.
#[derive(Deserialize)]
#[serde(tag = "type")]
enum TypedFrame {
    #[serde(rename = "ack")]
    Ack(Ack),
    #[serde(rename = "message.sent")]
    MessageSent(MessageSentEvent),
    #[serde(rename = "typing")]
    Typing(TypingEvent),
    #[serde(rename = "read_receipt.updated")]
    ReadReceiptUpdated(ReadReceiptEvent),
    #[serde(rename = "message.deleted")]
    MessageDeleted(MessageDeletedEvent),
    #[serde(rename = "presence.status")]
    PresenceStatus(PresenceSnapshot),
    #[serde(rename = "presence.updated")]
    PresenceUpdated(PresenceDelta),
    #[serde(rename = "inbox.updated")]
    InboxUpdated(InboxEvent),
}

impl From<TypedFrame> for InboundEvent {
    fn from(frame: TypedFrame) -> Self {
        match frame {
            TypedFrame::Ack(a) => InboundEvent::Ack(a),
            TypedFrame::MessageSent(m) => InboundEvent::MessageSent(m),
            TypedFrame::Typing(t) => InboundEvent::Typing(t),
            TypedFrame::ReadReceiptUpdated(r) => InboundEvent::ReadReceiptUpdated(r),
            TypedFrame::MessageDeleted(d) => InboundEvent::MessageDeleted(d),
            TypedFrame::PresenceStatus(p) => InboundEvent::PresenceStatus(p),
            TypedFrame::PresenceUpdated(p) => InboundEvent::PresenceUpdated(p),
            TypedFrame::InboxUpdated(i) => InboundEvent::InboxUpdated(i),
        }
    }
}

/// Decode one inbound text frame.
pub fn decode(raw: &str) -> ChatResult<InboundEvent> {
    let value: Value = serde_json::from_str(raw)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .and_then(EventKind::from_wire);

    match kind {
        Some(EventKind::Pong) => Ok(InboundEvent::Pong(value)),
        Some(EventKind::Notification) => Ok(InboundEvent::Notification(value)),
        Some(_) => {
            let typed: TypedFrame = serde_json::from_value(value)?;
            Ok(typed.into())
        }
        None => Ok(InboundEvent::Fallback(value)),
    }
}

/// Human-readable text of a `notification` frame.
pub fn notification_text(value: &Value) -> Option<String> {
    ["message", "body", "title"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .or_else(|| value.get("data").and_then(|d| d.get("message")).and_then(Value::as_str))
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ack {
    pub request_id: String,
    pub ok: bool,
    #[serde(default)]
    pub data: Option<AckData>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct AckData {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageSentEvent {
    pub conversation_id: String,
    pub message: WireMessage,
}

/// A message as the server describes it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    /// Echo of the sender's correlation id, when the server provides one.
    #[serde(default, alias = "client_id")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub deleted_for_everyone: bool,
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default)]
    pub attachment_kind: Option<AttachmentKind>,
    #[serde(default)]
    pub attachment_size: Option<u64>,
    #[serde(default)]
    pub attachment_name: Option<String>,
    #[serde(default)]
    pub shared_reference: Option<SharedReference>,
}

impl WireMessage {
    pub fn attachment(&self) -> Option<Attachment> {
        match (&self.attachment_url, self.attachment_kind) {
            (Some(url), Some(kind)) => Some(Attachment {
                url: url.clone(),
                kind,
                size: self.attachment_size.unwrap_or(0),
                name: self.attachment_name.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypingEvent {
    pub conversation_id: String,
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadReceiptEvent {
    pub conversation_id: String,
    /// The reader.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageDeletedEvent {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PresenceSnapshot {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub users: Vec<PresenceDelta>,
}

/// One user's presence. Absent optional fields mean "unchanged".
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PresenceDelta {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub is_online: bool,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboxEvent {
    #[serde(default)]
    pub conversations: Vec<ConversationSummary>,
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Parse a server timestamp: RFC 3339, or a naive date-time taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    debug!("Unparseable timestamp '{}', ignoring", raw);
    None
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => parse_timestamp(&s),
        Some(Value::Number(n)) => n.as_i64().and_then(|raw| {
            // Millisecond epochs are 13 digits, second epochs 10.
            if raw.abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }),
        _ => None,
    })
}

/// Guard used by handlers that need a field the frame type leaves optional.
pub fn require<T>(field: Option<T>, name: &'static str) -> ChatResult<T> {
    field.ok_or(ChatError::MissingField(name))
}
