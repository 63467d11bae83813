// Join/leave announcements for the active conversation

use log::{debug, info};

use super::connection::FrameSink;
use super::protocol::OutboundFrame;
use crate::models::{ConversationSession, JoinState};

pub struct SessionController {
    session: ConversationSession,
    last_joined: Option<String>,
}

impl SessionController {
    /// `conversation_id` is `None` for a brand new chat with `counterpart_id`.
    pub fn new(conversation_id: Option<String>, counterpart_id: Option<String>) -> Self {
        Self {
            session: ConversationSession {
                conversation_id,
                counterpart_id,
                join_state: JoinState::NotJoined,
            },
            last_joined: None,
        }
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.session.conversation_id.as_deref()
    }

    pub fn counterpart_id(&self) -> Option<&str> {
        self.session.counterpart_id.as_deref()
    }

    pub fn is_joined(&self) -> bool {
        self.session.join_state == JoinState::Joined
    }

    /// Announce entry into the current conversation, if it has an id yet.
    pub fn enter(&mut self, sink: &mut dyn FrameSink) -> bool {
        match self.session.conversation_id.clone() {
            Some(id) => {
                self.join(&id, sink);
                true
            }
            None => {
                debug!("No conversation id yet, deferring join");
                false
            }
        }
    }

    /// Make `conversation_id` the active conversation and join it.
    ///
    /// A previously joined real conversation is left first; the "no
    /// conversation yet" placeholder is never left. Returns false if
    /// `conversation_id` was already the joined conversation.
    pub fn switch_to(&mut self, conversation_id: &str, sink: &mut dyn FrameSink) -> bool {
        if self.is_joined() && self.last_joined.as_deref() == Some(conversation_id) {
            return false;
        }
        if let Some(previous) = self.last_joined.clone() {
            if previous != conversation_id {
                self.leave(sink);
            }
        }
        self.join(conversation_id, sink);
        true
    }

    fn join(&mut self, conversation_id: &str, sink: &mut dyn FrameSink) {
        info!("Joining conversation {}", conversation_id);
        sink.send(&OutboundFrame::JoinConversation {
            conversation_id: conversation_id.to_string(),
        });
        sink.send(&OutboundFrame::GetPresence {
            conversation_id: conversation_id.to_string(),
        });
        self.session.conversation_id = Some(conversation_id.to_string());
        self.session.join_state = JoinState::Joined;
        self.last_joined = Some(conversation_id.to_string());
    }

    /// Leave the most recently joined conversation. No-op if none.
    pub fn leave(&mut self, sink: &mut dyn FrameSink) {
        if let Some(conversation_id) = self.last_joined.take() {
            info!("Leaving conversation {}", conversation_id);
            sink.send(&OutboundFrame::LeaveConversation { conversation_id });
        }
        self.session.join_state = JoinState::NotJoined;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Sink(Vec<String>);

    impl FrameSink for Sink {
        fn send(&mut self, frame: &OutboundFrame) -> bool {
            self.0.push(frame.action().to_string());
            true
        }
    }

    #[test]
    fn test_enter_and_leave() {
        let mut sink = Sink::default();
        let mut controller = SessionController::new(Some("c1".to_string()), None);
        assert!(controller.enter(&mut sink));
        assert!(controller.is_joined());
        controller.leave(&mut sink);
        controller.leave(&mut sink);
        assert_eq!(sink.0, vec!["join_conversation", "get_presence", "leave_conversation"]);
    }

    #[test]
    fn test_placeholder_switch_skips_leave() {
        let mut sink = Sink::default();
        let mut controller = SessionController::new(None, Some("u2".to_string()));
        assert!(!controller.enter(&mut sink));
        assert!(controller.switch_to("c9", &mut sink));
        assert!(!controller.switch_to("c9", &mut sink));
        assert_eq!(sink.0, vec!["join_conversation", "get_presence"]);
        assert_eq!(controller.conversation_id(), Some("c9"));
    }

    #[test]
    fn test_switch_between_real_conversations_leaves_old() {
        let mut sink = Sink::default();
        let mut controller = SessionController::new(Some("c1".to_string()), None);
        controller.enter(&mut sink);
        controller.switch_to("c2", &mut sink);
        assert_eq!(
            sink.0,
            vec![
                "join_conversation",
                "get_presence",
                "leave_conversation",
                "join_conversation",
                "get_presence"
            ]
        );
    }
}
