// Core data types shared by the chat sync engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery state of a timeline entry.
///
/// Advances `Sending -> Sent -> Read` and never moves backwards. `Error` is
/// only reachable from `Sending` (a rejected send) and can still be upgraded
/// if the server later reports the message as stored.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Read,
    Error,
}

impl MessageStatus {
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Sending, Sent) | (Sending, Read) | (Sending, Error) | (Sent, Read) | (Error, Sent) | (Error, Read)
        )
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::Audio => "audio",
        }
    }
}

/// Uploaded file descriptor, as returned by the upload collaborator.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub kind: AttachmentKind,
    pub size: u64,
    pub name: String,
}

/// Reference to shared app content (a verse, a note, a wallpaper).
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct SharedReference {
    pub kind: String,
    pub reference_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Server id once acknowledged, otherwise the local correlation id.
    pub id: String,
    pub sender_id: String,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    pub is_own: bool,
    pub status: MessageStatus,
    pub deleted_for_everyone: bool,
    pub attachment: Option<Attachment>,
    pub shared_reference: Option<SharedReference>,
}

impl Message {
    /// Optimistic entry for a message the local user is sending.
    pub fn outgoing(correlation_id: &str, sender_id: &str, text: &str, now: DateTime<Utc>) -> Self {
        Message {
            id: correlation_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            created_at: Some(now),
            is_own: true,
            status: MessageStatus::Sending,
            deleted_for_everyone: false,
            attachment: None,
            shared_reference: None,
        }
    }

    /// Text to render, hidden once the message is deleted for everyone.
    pub fn visible_text(&self) -> Option<&str> {
        if self.deleted_for_everyone {
            None
        } else {
            Some(&self.text)
        }
    }

    pub fn visible_attachment(&self) -> Option<&Attachment> {
        if self.deleted_for_everyone {
            None
        } else {
            self.attachment.as_ref()
        }
    }

    /// Move to `next` if that is a forward transition. Returns whether the status changed.
    pub fn advance_status(&mut self, next: MessageStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// A send that is waiting for its acknowledgement.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub correlation_id: String,
    pub draft: Message,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum JoinState {
    NotJoined,
    Joined,
}

#[derive(Debug, Clone)]
pub struct ConversationSession {
    /// `None` until the server assigns an id (first message to a new counterpart).
    pub conversation_id: Option<String>,
    pub counterpart_id: Option<String>,
    pub join_state: JoinState,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub display_name: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// One row of the inbox listing.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    #[serde(default)]
    pub counterpart_id: Option<String>,
    #[serde(default)]
    pub counterpart_name: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One-shot, user-visible notice (collaborator failure, server notification).
#[derive(Debug, PartialEq, Clone)]
pub enum Notice {
    Info(String),
    Error(String),
}
