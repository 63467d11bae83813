// Chat sync engine
// Composes the timeline, outbound pipeline, presence, typing and session
// components. Every method is one synchronous step; the caller's event loop
// serialises them.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::connection::{ConnectionManager, FrameSink};
use super::dispatcher::EventDispatcher;
use super::outbound::{AckOutcome, BroadcastOutcome, Destination, Draft, OutboundPipeline};
use super::presence::PresenceTracker;
use super::protocol::{self, EventKind, InboundEvent};
use super::session::SessionController;
use super::timeline::Timeline;
use super::typing::TypingIndicator;
use crate::collab::HistoryQuery;
use crate::error::{ChatError, ChatResult};
use crate::models::{Attachment, ConversationSummary, Message, MessageStatus, Notice, PresenceRecord};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub local_user_id: String,
    pub typing_debounce: Duration,
    pub delete_window: Duration,
}

pub struct ChatEngine {
    settings: EngineSettings,
    timeline: Timeline,
    outbound: OutboundPipeline,
    presence: PresenceTracker,
    typing: TypingIndicator,
    session: SessionController,
    dispatcher: EventDispatcher,
    inbox: Vec<ConversationSummary>,
    notices: VecDeque<Notice>,
    loading_history: bool,
    history_loaded: bool,
    history_complete: bool,
}

impl ChatEngine {
    pub fn new(settings: EngineSettings, conversation_id: Option<String>, counterpart_id: Option<String>) -> Self {
        Self {
            outbound: OutboundPipeline::new(&settings.local_user_id, settings.delete_window),
            typing: TypingIndicator::new(settings.typing_debounce),
            session: SessionController::new(conversation_id, counterpart_id),
            timeline: Timeline::new(),
            presence: PresenceTracker::new(),
            dispatcher: EventDispatcher::new(),
            inbox: Vec::new(),
            notices: VecDeque::new(),
            loading_history: false,
            history_loaded: false,
            history_complete: false,
            settings,
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.settings.local_user_id
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn presence_records(&self, user_ids: &[&str]) -> Vec<PresenceRecord> {
        user_ids.iter().filter_map(|id| self.presence.get(id).cloned()).collect()
    }

    pub fn typing_users(&self) -> Vec<String> {
        self.typing.typing_users().into_iter().map(str::to_string).collect()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.session.conversation_id()
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    pub fn inbox(&self) -> &[ConversationSummary] {
        &self.inbox
    }

    pub fn pending_sends(&self) -> usize {
        self.outbound.pending_count()
    }

    pub fn is_loading_history(&self) -> bool {
        self.loading_history
    }

    /// Observer registry; handlers run after the engine has applied each event.
    pub fn dispatcher_mut(&mut self) -> &mut EventDispatcher {
        &mut self.dispatcher
    }

    /// One-shot notices queued since the last call.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    fn notify(&mut self, notice: Notice) {
        self.notices.push_back(notice);
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Transport came up: (re)announce the active conversation.
    pub fn on_connected(&mut self, sink: &mut dyn FrameSink) {
        self.session.enter(sink);
    }

    /// Leave the current conversation and start a fresh one.
    pub fn open_conversation(
        &mut self,
        conversation_id: Option<String>,
        counterpart_id: Option<String>,
        sink: &mut dyn FrameSink,
    ) {
        self.leave(sink);
        self.session = SessionController::new(conversation_id, counterpart_id);
        self.timeline.clear();
        self.outbound.clear_pending();
        self.history_loaded = false;
        self.history_complete = false;
        self.loading_history = false;
        self.session.enter(sink);
    }

    /// Leave the joined conversation, discarding its ephemeral state.
    pub fn leave(&mut self, sink: &mut dyn FrameSink) {
        self.typing.cancel();
        self.session.leave(sink);
        self.presence.clear();
        self.typing.clear_remote();
    }

    // Only a session still waiting for its first conversation id adopts one
    // from the server; an established session never changes implicitly.
    fn adopt_conversation(&mut self, conversation_id: &str, sink: &mut dyn FrameSink) {
        if let Some(active) = self.session.conversation_id() {
            if active != conversation_id {
                debug!("Ignoring server conversation {} while in {}", conversation_id, active);
            }
            return;
        }
        self.switch_conversation(conversation_id, sink);
    }

    fn switch_conversation(&mut self, conversation_id: &str, sink: &mut dyn FrameSink) {
        if self.session.switch_to(conversation_id, sink) {
            info!("Active conversation is now {}", conversation_id);
            self.presence.clear();
            self.typing.clear_remote();
        }
    }

    /// Teardown order: typing timer, leave, connection.
    pub fn teardown(&mut self, connection: &mut ConnectionManager) {
        self.typing.cancel();
        self.session.leave(connection);
        connection.disconnect();
        self.presence.clear();
        self.typing.clear_remote();
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Decode, apply and publish one inbound frame. Bad frames are logged and dropped.
    pub fn handle_frame(&mut self, raw: &str, sink: &mut dyn FrameSink) -> Option<EventKind> {
        let event = match protocol::decode(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping inbound frame: {}", e);
                return None;
            }
        };
        self.apply(&event, sink);
        self.dispatcher.publish(&event);
        Some(event.kind())
    }

    fn is_active(&self, conversation_id: &str) -> bool {
        self.session.conversation_id() == Some(conversation_id)
    }

    fn scoped(&self, conversation_id: Option<&str>) -> bool {
        conversation_id.map_or(true, |id| self.is_active(id))
    }

    pub fn apply(&mut self, event: &InboundEvent, sink: &mut dyn FrameSink) {
        match event {
            InboundEvent::Ack(ack) => match self.outbound.handle_ack(ack, &mut self.timeline) {
                AckOutcome::Sent {
                    conversation_id: Some(conversation_id),
                    ..
                } => self.adopt_conversation(&conversation_id, sink),
                AckOutcome::SendFailed { error, .. } => {
                    let reason = error.unwrap_or_else(|| "unknown error".to_string());
                    self.notify(Notice::Error(format!("Message could not be sent: {}", reason)));
                }
                AckOutcome::DeleteFailed { error, .. } => {
                    let reason = error.unwrap_or_else(|| "unknown error".to_string());
                    self.notify(Notice::Error(format!("Message could not be deleted: {}", reason)));
                }
                _ => {}
            },
            InboundEvent::MessageSent(sent) => {
                if !self.is_active(&sent.conversation_id) {
                    let ours = self.outbound.owns_request(sent.message.request_id.as_deref());
                    if !ours || self.session.conversation_id().is_some() {
                        debug!("message.sent for inactive conversation {}", sent.conversation_id);
                        return;
                    }
                    self.adopt_conversation(&sent.conversation_id, sink);
                }
                let outcome = self.outbound.handle_broadcast(sent, &mut self.timeline);
                debug!("message.sent applied: {:?}", outcome);
                if let BroadcastOutcome::Inserted(id) = outcome {
                    if sent.message.sender_id != self.settings.local_user_id {
                        self.mark_read_if_counterpart_online(&id, sink);
                    }
                }
            }
            InboundEvent::Typing(typing) => {
                let fallback = self.presence.display_name(&typing.user_id).map(str::to_string);
                self.typing.apply_remote(
                    typing,
                    self.session.conversation_id(),
                    &self.settings.local_user_id,
                    fallback.as_deref(),
                );
            }
            InboundEvent::ReadReceiptUpdated(receipt) => {
                if !self.is_active(&receipt.conversation_id) {
                    return;
                }
                if receipt.user_id.as_deref() == Some(self.settings.local_user_id.as_str()) {
                    debug!("Ignoring our own read receipt");
                    return;
                }
                match protocol::require(receipt.last_read_at, "last_read_at") {
                    Ok(last_read_at) => {
                        let changed = self.timeline.apply_read_receipt(last_read_at);
                        debug!("Read receipt up to {} marked {} messages read", last_read_at, changed);
                    }
                    Err(e) => warn!("Ignoring read receipt: {}", e),
                }
            }
            InboundEvent::MessageDeleted(deleted) => {
                if self.is_active(&deleted.conversation_id) {
                    self.outbound.apply_deleted(deleted, &mut self.timeline);
                }
            }
            InboundEvent::PresenceStatus(snapshot) => {
                if self.scoped(snapshot.conversation_id.as_deref()) {
                    self.presence.apply_snapshot(snapshot);
                }
            }
            InboundEvent::PresenceUpdated(delta) => {
                if self.scoped(delta.conversation_id.as_deref()) {
                    self.presence.apply_delta(delta);
                }
            }
            InboundEvent::InboxUpdated(inbox) => {
                self.inbox = inbox.conversations.clone();
            }
            InboundEvent::Pong(_) => debug!("pong"),
            InboundEvent::Notification(value) => {
                let text = protocol::notification_text(value).unwrap_or_else(|| value.to_string());
                self.notify(Notice::Info(text));
            }
            InboundEvent::Fallback(value) => debug!("Unrouted frame: {}", value),
        }
    }

    // Stand-in for "the message is on screen": only acknowledge reads while
    // the other side is online.
    fn mark_read_if_counterpart_online(&mut self, message_id: &str, sink: &mut dyn FrameSink) {
        if !self.presence.any_counterpart_online(&self.settings.local_user_id) {
            return;
        }
        if let Some(conversation_id) = self.session.conversation_id().map(str::to_string) {
            self.outbound.mark_read(&conversation_id, message_id, sink);
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    pub fn send_text(&mut self, text: &str, sink: &mut dyn FrameSink) -> ChatResult<String> {
        self.send_draft(Draft::text(text), sink)
    }

    /// Send an uploaded file, with an optional caption.
    pub fn send_attachment(&mut self, caption: &str, attachment: Attachment, sink: &mut dyn FrameSink) -> ChatResult<String> {
        self.send_draft(
            Draft {
                text: caption.to_string(),
                attachment: Some(attachment),
                shared_reference: None,
            },
            sink,
        )
    }

    pub fn send_draft(&mut self, draft: Draft, sink: &mut dyn FrameSink) -> ChatResult<String> {
        let conversation_id = self.session.conversation_id().map(str::to_string);
        let counterpart_id = self.session.counterpart_id().map(str::to_string);
        let destination = match (&conversation_id, &counterpart_id) {
            (Some(id), _) => Destination::Conversation(id),
            (None, Some(user)) => Destination::Recipient(user),
            (None, None) => return Err(ChatError::NoConversation),
        };
        Ok(self.outbound.send(draft, destination, Utc::now(), &mut self.timeline, sink))
    }

    pub fn can_delete(&self, message_id: &str) -> bool {
        self.timeline
            .get(message_id)
            .is_some_and(|m| self.outbound.can_delete(m, Utc::now()))
    }

    pub fn delete_message(&mut self, message_id: &str, sink: &mut dyn FrameSink) -> ChatResult<String> {
        let conversation_id = self
            .session
            .conversation_id()
            .map(str::to_string)
            .ok_or(ChatError::NoConversation)?;
        self.outbound
            .request_delete(message_id, &conversation_id, Utc::now(), &self.timeline, sink)
    }

    pub fn request_inbox(&mut self, sink: &mut dyn FrameSink) -> Option<String> {
        self.outbound.request_inbox(sink)
    }

    // -----------------------------------------------------------------------
    // Typing
    // -----------------------------------------------------------------------

    pub fn on_input(&mut self, now: Instant, sink: &mut dyn FrameSink) {
        if let Some(conversation_id) = self.session.conversation_id().map(str::to_string) {
            self.typing.on_input(now, &conversation_id, sink);
        }
    }

    pub fn poll_timers(&mut self, now: Instant, sink: &mut dyn FrameSink) {
        self.typing.poll(now, sink);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.typing.next_deadline()
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Mark history as loading and return the page to fetch: the newest page
    /// first, then pages older than the oldest confirmed message. `None` while
    /// a load is running, once the start of the conversation was reached, or
    /// when there is no conversation yet.
    pub fn begin_history_load(&mut self) -> Option<HistoryQuery> {
        if self.loading_history || self.history_complete {
            return None;
        }
        let conversation_id = self.session.conversation_id()?;
        let oldest = self
            .timeline
            .messages()
            .iter()
            .find(|m| !matches!(m.status, MessageStatus::Sending | MessageStatus::Error));
        let query = match oldest {
            Some(message) if self.history_loaded => HistoryQuery::before(conversation_id, &message.id),
            _ => HistoryQuery::latest(conversation_id),
        };
        self.loading_history = true;
        Some(query)
    }

    /// Seed the timeline from a history page, or surface the failure. Pages
    /// fetched for a conversation that is no longer active are discarded.
    pub fn finish_history_load(
        &mut self,
        conversation_id: &str,
        result: anyhow::Result<Vec<Message>>,
        sink: &mut dyn FrameSink,
    ) {
        if !self.is_active(conversation_id) {
            debug!("Discarding history page for inactive conversation {}", conversation_id);
            return;
        }
        self.loading_history = false;
        match result {
            Ok(messages) => {
                if messages.is_empty() {
                    info!("No more history for {}", conversation_id);
                    self.history_complete = true;
                }
                let inserted = self.timeline.merge_all(messages);
                info!("History load inserted {} messages", inserted);
                if !self.history_loaded {
                    self.history_loaded = true;
                    if let Some(message_id) = self.timeline.newest().map(|m| m.id.clone()) {
                        self.outbound.mark_read(conversation_id, &message_id, sink);
                    }
                }
            }
            Err(e) => {
                warn!("History load failed: {:#}", e);
                self.report_failure("Could not load messages", &e);
            }
        }
    }

    /// Surface a collaborator failure to the user.
    pub fn report_failure(&mut self, context: &str, error: &anyhow::Error) {
        self.notify(Notice::Error(format!("{}: {}", context, error)));
    }
}
