// Typing indicators
// Local side debounces keystrokes into one start/stop pair; remote side keeps
// who is typing in the active conversation until they say they stopped.

use log::debug;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::connection::FrameSink;
use super::protocol::{OutboundFrame, TypingEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalTyping {
    Idle,
    Active { conversation_id: String, deadline: Instant },
}

pub struct TypingIndicator {
    debounce: Duration,
    local: LocalTyping,
    // Ordered so the rendered "X and Y are typing" line is stable.
    remote: BTreeMap<String, String>,
}

impl TypingIndicator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            local: LocalTyping::Idle,
            remote: BTreeMap::new(),
        }
    }

    pub fn is_local_typing(&self) -> bool {
        matches!(self.local, LocalTyping::Active { .. })
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.local {
            LocalTyping::Active { deadline, .. } => Some(*deadline),
            LocalTyping::Idle => None,
        }
    }

    /// A keystroke in the composer. Sends `typing{true}` only on the first
    /// keystroke of a burst; every keystroke pushes the stop deadline out.
    pub fn on_input(&mut self, now: Instant, conversation_id: &str, sink: &mut dyn FrameSink) {
        let deadline = now + self.debounce;
        if let LocalTyping::Active { conversation_id: active, deadline: current } = &mut self.local {
            if active == conversation_id {
                *current = deadline;
                return;
            }
        }
        // Switching conversations mid-burst: close the old one first.
        self.flush(sink);
        sink.send(&OutboundFrame::Typing {
            conversation_id: conversation_id.to_string(),
            is_typing: true,
        });
        self.local = LocalTyping::Active {
            conversation_id: conversation_id.to_string(),
            deadline,
        };
    }

    /// Fire the debounce timer if due, sending `typing{false}`.
    pub fn poll(&mut self, now: Instant, sink: &mut dyn FrameSink) -> bool {
        match &self.local {
            LocalTyping::Active { deadline, .. } if now >= *deadline => {
                self.flush(sink);
                true
            }
            _ => false,
        }
    }

    fn flush(&mut self, sink: &mut dyn FrameSink) {
        if let LocalTyping::Active { conversation_id, .. } = std::mem::replace(&mut self.local, LocalTyping::Idle) {
            sink.send(&OutboundFrame::Typing {
                conversation_id,
                is_typing: false,
            });
        }
    }

    /// Drop the local timer without sending anything (teardown).
    pub fn cancel(&mut self) {
        if self.is_local_typing() {
            debug!("Cancelling typing debounce timer");
        }
        self.local = LocalTyping::Idle;
    }

    /// Apply a remote typing event. Events about ourselves or another
    /// conversation are ignored. Returns whether the map changed.
    pub fn apply_remote(
        &mut self,
        event: &TypingEvent,
        active_conversation: Option<&str>,
        local_user_id: &str,
        fallback_name: Option<&str>,
    ) -> bool {
        if event.user_id == local_user_id || active_conversation != Some(event.conversation_id.as_str()) {
            return false;
        }
        if event.is_typing {
            let name = event
                .display_name
                .clone()
                .or_else(|| fallback_name.map(str::to_string))
                .unwrap_or_else(|| event.user_id.clone());
            self.remote.insert(event.user_id.clone(), name).is_none()
        } else {
            self.remote.remove(&event.user_id).is_some()
        }
    }

    /// Display names of users currently typing.
    pub fn typing_users(&self) -> Vec<&str> {
        self.remote.values().map(String::as_str).collect()
    }

    pub fn clear_remote(&mut self) {
        self.remote.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Sink(Vec<OutboundFrame>);

    impl FrameSink for Sink {
        fn send(&mut self, frame: &OutboundFrame) -> bool {
            self.0.push(frame.clone());
            true
        }
    }

    fn typing(conversation: &str, user: &str, is_typing: bool) -> TypingEvent {
        TypingEvent {
            conversation_id: conversation.to_string(),
            user_id: user.to_string(),
            display_name: Some(format!("{} name", user)),
            is_typing,
        }
    }

    #[test]
    fn test_burst_produces_one_start_and_one_stop() {
        let mut sink = Sink::default();
        let mut indicator = TypingIndicator::new(Duration::from_secs(2));
        let t0 = Instant::now();
        for ms in [0u64, 300, 900, 1500, 1900] {
            indicator.on_input(t0 + Duration::from_millis(ms), "c1", &mut sink);
        }
        // Last keystroke at 1.9s, so nothing fires until 3.9s
        assert!(!indicator.poll(t0 + Duration::from_millis(3800), &mut sink));
        assert!(indicator.poll(t0 + Duration::from_millis(3900), &mut sink));
        assert!(!indicator.poll(t0 + Duration::from_secs(10), &mut sink));

        assert_eq!(
            sink.0,
            vec![
                OutboundFrame::Typing { conversation_id: "c1".to_string(), is_typing: true },
                OutboundFrame::Typing { conversation_id: "c1".to_string(), is_typing: false },
            ]
        );
    }

    #[test]
    fn test_cancel_sends_nothing() {
        let mut sink = Sink::default();
        let mut indicator = TypingIndicator::new(Duration::from_secs(2));
        let t0 = Instant::now();
        indicator.on_input(t0, "c1", &mut sink);
        indicator.cancel();
        assert!(indicator.next_deadline().is_none());
        assert!(!indicator.poll(t0 + Duration::from_secs(5), &mut sink));
        assert_eq!(sink.0.len(), 1);
    }

    #[test]
    fn test_remote_typing_map() {
        let mut indicator = TypingIndicator::new(Duration::from_secs(2));
        assert!(indicator.apply_remote(&typing("c1", "u1", true), Some("c1"), "me", None));
        assert!(!indicator.apply_remote(&typing("c1", "u1", true), Some("c1"), "me", None));
        assert_eq!(indicator.typing_users(), vec!["u1 name"]);

        // Ourselves and other conversations are ignored
        assert!(!indicator.apply_remote(&typing("c1", "me", true), Some("c1"), "me", None));
        assert!(!indicator.apply_remote(&typing("c2", "u2", true), Some("c1"), "me", None));
        assert_eq!(indicator.typing_users().len(), 1);

        assert!(indicator.apply_remote(&typing("c1", "u1", false), Some("c1"), "me", None));
        assert!(indicator.typing_users().is_empty());
    }
}
