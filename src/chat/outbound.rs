// Outbound message pipeline
// Optimistic local insertion, correlation of acks and broadcasts with
// pending sends, and the client-side delete rule.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use uuid::Uuid;

use super::connection::FrameSink;
use super::protocol::{Ack, MessageDeletedEvent, MessageSentEvent, OutboundFrame, SendMessageFrame, WireMessage};
use super::timeline::{MergeOutcome, Timeline};
use crate::error::{ChatError, ChatResult};
use crate::models::{Attachment, Message, MessageStatus, OutboundRequest, SharedReference};

/// What the user wants to send.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub text: String,
    pub attachment: Option<Attachment>,
    pub shared_reference: Option<SharedReference>,
}

impl Draft {
    pub fn text(text: &str) -> Self {
        Draft {
            text: text.to_string(),
            ..Default::default()
        }
    }
}

/// Where a send is addressed: an existing conversation, or a user we have
/// no conversation with yet.
#[derive(Debug, Clone, Copy)]
pub enum Destination<'a> {
    Conversation(&'a str),
    Recipient(&'a str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// A pending send was confirmed; `conversation_id` is set when the server created one.
    Sent {
        message_id: String,
        conversation_id: Option<String>,
    },
    SendFailed {
        correlation_id: String,
        error: Option<String>,
    },
    DeleteFailed {
        message_id: String,
        error: Option<String>,
    },
    /// Ack for a request with no timeline effect (get_inbox, accepted delete).
    Acknowledged,
    /// Ack for a request we never sent, or already resolved.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastOutcome {
    Inserted(String),
    /// Matched a pending local send and upgraded it.
    Reconciled(String),
    Updated(String),
    Duplicate(String),
}

// Requests whose ack changes what the user sees. mark_read is fire-and-forget.
#[derive(Debug, Clone)]
enum OtherRequest {
    Delete { message_id: String },
    Inbox,
}

pub struct OutboundPipeline {
    local_user_id: String,
    delete_window: ChronoDuration,
    pending_sends: HashMap<String, OutboundRequest>,
    pending_other: HashMap<String, OtherRequest>,
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

impl OutboundPipeline {
    pub fn new(local_user_id: &str, delete_window: std::time::Duration) -> Self {
        Self {
            local_user_id: local_user_id.to_string(),
            delete_window: ChronoDuration::from_std(delete_window).unwrap_or_else(|_| ChronoDuration::minutes(15)),
            pending_sends: HashMap::new(),
            pending_other: HashMap::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending_sends.len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending_sends.contains_key(correlation_id)
    }

    /// Outstanding delete and inbox requests awaiting an ack.
    pub fn pending_request_count(&self) -> usize {
        self.pending_other.len()
    }

    /// Forget every outstanding request. Acks that arrive later resolve as `Unknown`.
    pub fn clear_pending(&mut self) {
        if !self.pending_sends.is_empty() || !self.pending_other.is_empty() {
            debug!(
                "Dropping {} pending sends and {} pending requests",
                self.pending_sends.len(),
                self.pending_other.len()
            );
        }
        self.pending_sends.clear();
        self.pending_other.clear();
    }

    /// Append an optimistic entry and transmit `send_message`. Returns the correlation id.
    ///
    /// If the transport is closed the frame is dropped and the entry stays `sending`.
    pub fn send(
        &mut self,
        draft: Draft,
        destination: Destination<'_>,
        now: DateTime<Utc>,
        timeline: &mut Timeline,
        sink: &mut dyn FrameSink,
    ) -> String {
        let correlation_id = new_request_id();
        let mut message = Message::outgoing(&correlation_id, &self.local_user_id, &draft.text, now);
        message.attachment = draft.attachment.clone();
        message.shared_reference = draft.shared_reference.clone();
        timeline.merge(message.clone());

        let (conversation_id, recipient_id) = match destination {
            Destination::Conversation(id) => (Some(id.to_string()), None),
            Destination::Recipient(id) => (None, Some(id.to_string())),
        };
        let mut frame = SendMessageFrame {
            request_id: correlation_id.clone(),
            conversation_id,
            recipient_id,
            text: draft.text,
            attachment_url: None,
            attachment_kind: None,
            attachment_size: None,
            attachment_name: None,
            shared_reference: draft.shared_reference,
        };
        if let Some(attachment) = &draft.attachment {
            frame = frame.with_attachment(attachment);
        }
        if !sink.send(&OutboundFrame::SendMessage(frame)) {
            debug!("Message {} left in sending state", correlation_id);
        }

        self.pending_sends.insert(
            correlation_id.clone(),
            OutboundRequest {
                correlation_id: correlation_id.clone(),
                draft: message,
            },
        );
        correlation_id
    }

    /// Reconcile an `ack` frame against our pending requests.
    pub fn handle_ack(&mut self, ack: &Ack, timeline: &mut Timeline) -> AckOutcome {
        if let Some(request) = self.pending_sends.remove(&ack.request_id) {
            let correlation_id = request.correlation_id;
            if !ack.ok {
                warn!("Send {} rejected: {}", correlation_id, ack.error.as_deref().unwrap_or("no reason given"));
                timeline.set_status(&correlation_id, MessageStatus::Error);
                return AckOutcome::SendFailed {
                    correlation_id,
                    error: ack.error.clone(),
                };
            }
            let data = ack.data.clone().unwrap_or_default();
            let message_id = match data.message_id {
                Some(id) => id,
                None => {
                    warn!("Ack for {} carries no message id, keeping correlation id", correlation_id);
                    correlation_id.clone()
                }
            };
            timeline.confirm(&correlation_id, &message_id, data.created_at);
            info!("Message {} confirmed as {}", correlation_id, message_id);
            return AckOutcome::Sent {
                message_id,
                conversation_id: data.conversation_id,
            };
        }

        match self.pending_other.remove(&ack.request_id) {
            Some(OtherRequest::Delete { message_id }) if !ack.ok => {
                warn!("Delete of {} rejected: {}", message_id, ack.error.as_deref().unwrap_or("no reason given"));
                AckOutcome::DeleteFailed {
                    message_id,
                    error: ack.error.clone(),
                }
            }
            Some(OtherRequest::Inbox) if !ack.ok => {
                warn!("get_inbox rejected: {}", ack.error.as_deref().unwrap_or("no reason given"));
                AckOutcome::Acknowledged
            }
            Some(_) => AckOutcome::Acknowledged,
            None => {
                debug!("Ack for unknown request {}", ack.request_id);
                AckOutcome::Unknown
            }
        }
    }

    /// Whether a broadcast echoing `request_id` belongs to one of our sends.
    pub fn owns_request(&self, request_id: Option<&str>) -> bool {
        request_id.is_some_and(|id| self.pending_sends.contains_key(id))
    }

    /// Apply a `message.sent` broadcast.
    pub fn handle_broadcast(&mut self, event: &MessageSentEvent, timeline: &mut Timeline) -> BroadcastOutcome {
        let wire = &event.message;

        // Correlated echo of one of our sends
        if let Some(request_id) = wire.request_id.as_deref() {
            if self.pending_sends.remove(request_id).is_some() {
                timeline.confirm(request_id, &wire.id, wire.created_at);
                return BroadcastOutcome::Reconciled(wire.id.clone());
            }
        }

        if timeline.contains(&wire.id) {
            return match timeline.merge(self.to_message(wire)) {
                MergeOutcome::Unchanged => BroadcastOutcome::Duplicate(wire.id.clone()),
                _ => BroadcastOutcome::Updated(wire.id.clone()),
            };
        }

        // Own message without an echo: match the oldest pending entry with the same content.
        if wire.sender_id == self.local_user_id {
            if let Some(correlation_id) = self.match_pending(wire) {
                self.pending_sends.remove(&correlation_id);
                timeline.confirm(&correlation_id, &wire.id, wire.created_at);
                return BroadcastOutcome::Reconciled(wire.id.clone());
            }
        }

        timeline.merge(self.to_message(wire));
        BroadcastOutcome::Inserted(wire.id.clone())
    }

    // Without an echoed request id, identical drafts are indistinguishable:
    // two sends of the same text may be rekeyed in swapped order. Both end up
    // confirmed, only the local/server id pairing can cross.
    fn match_pending(&self, wire: &WireMessage) -> Option<String> {
        let attachment_url = wire.attachment_url.as_deref();
        self.pending_sends
            .values()
            .filter(|req| {
                req.draft.text == wire.text
                    && req.draft.attachment.as_ref().map(|a| a.url.as_str()) == attachment_url
            })
            .min_by_key(|req| req.draft.created_at)
            .map(|req| req.correlation_id.clone())
    }

    fn to_message(&self, wire: &WireMessage) -> Message {
        Message {
            id: wire.id.clone(),
            sender_id: wire.sender_id.clone(),
            text: wire.text.clone(),
            created_at: wire.created_at,
            is_own: wire.sender_id == self.local_user_id,
            status: MessageStatus::Sent,
            deleted_for_everyone: wire.deleted_for_everyone,
            attachment: wire.attachment(),
            shared_reference: wire.shared_reference.clone(),
        }
    }

    /// Client-side delete rule: own, not deleted, confirmed, and recent enough.
    pub fn can_delete(&self, message: &Message, now: DateTime<Utc>) -> bool {
        if !message.is_own || message.deleted_for_everyone {
            return false;
        }
        if matches!(message.status, MessageStatus::Sending | MessageStatus::Error) {
            return false;
        }
        match message.created_at {
            Some(created) => now.signed_duration_since(created) <= self.delete_window,
            None => false,
        }
    }

    /// Transmit `delete_message`. The entry is only marked once the
    /// `message.deleted` broadcast arrives.
    pub fn request_delete(
        &mut self,
        message_id: &str,
        conversation_id: &str,
        now: DateTime<Utc>,
        timeline: &Timeline,
        sink: &mut dyn FrameSink,
    ) -> ChatResult<String> {
        let message = timeline
            .get(message_id)
            .ok_or_else(|| ChatError::UnknownMessage(message_id.to_string()))?;
        if !self.can_delete(message, now) {
            return Err(ChatError::DeleteNotAllowed(message_id.to_string()));
        }
        let request_id = new_request_id();
        let sent = sink.send(&OutboundFrame::DeleteMessage {
            request_id: request_id.clone(),
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        });
        if !sent {
            return Err(ChatError::NotConnected);
        }
        self.pending_other.insert(
            request_id.clone(),
            OtherRequest::Delete {
                message_id: message_id.to_string(),
            },
        );
        Ok(request_id)
    }

    /// Apply a `message.deleted` broadcast (ours or anyone's).
    pub fn apply_deleted(&self, event: &MessageDeletedEvent, timeline: &mut Timeline) -> bool {
        let applied = timeline.mark_deleted(&event.message_id);
        if !applied {
            debug!("Delete for unknown message {}", event.message_id);
        }
        applied
    }

    /// Fire-and-forget; any ack for it resolves as `Unknown`.
    pub fn mark_read(&mut self, conversation_id: &str, message_id: &str, sink: &mut dyn FrameSink) -> bool {
        sink.send(&OutboundFrame::MarkRead {
            request_id: new_request_id(),
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        })
    }

    /// Returns the request id, or `None` if the frame was dropped.
    pub fn request_inbox(&mut self, sink: &mut dyn FrameSink) -> Option<String> {
        let request_id = new_request_id();
        if !sink.send(&OutboundFrame::GetInbox {
            request_id: request_id.clone(),
        }) {
            return None;
        }
        self.pending_other.insert(request_id.clone(), OtherRequest::Inbox);
        Some(request_id)
    }
}
