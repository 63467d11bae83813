// Common test utilities for integration tests
// Recording sinks and inbound frame builders shared by the engine and
// connection tests.
#![allow(dead_code)]

use std::sync::Once;

use log::LevelFilter;
use serde_json::{json, Value};

use chatsync::chat::{ChatEngine, EngineSettings, FrameSink, OutboundFrame};
use std::time::Duration;

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub const ME: &str = "me";
pub const PEER: &str = "peer";

/// Captures every outbound frame; `open = false` simulates a closed transport.
pub struct RecordingSink {
    pub frames: Vec<OutboundFrame>,
    pub open: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        RecordingSink {
            frames: Vec::new(),
            open: true,
        }
    }

    pub fn closed() -> Self {
        RecordingSink {
            frames: Vec::new(),
            open: false,
        }
    }

    pub fn actions(&self) -> Vec<&'static str> {
        self.frames.iter().map(OutboundFrame::action).collect()
    }

    pub fn take(&mut self) -> Vec<OutboundFrame> {
        std::mem::take(&mut self.frames)
    }

    /// Correlation id of the most recent send_message frame.
    pub fn last_request_id(&self) -> Option<String> {
        self.frames.iter().rev().find_map(|frame| match frame {
            OutboundFrame::SendMessage(send) => Some(send.request_id.clone()),
            _ => None,
        })
    }
}

impl FrameSink for RecordingSink {
    fn send(&mut self, frame: &OutboundFrame) -> bool {
        if self.open {
            self.frames.push(frame.clone());
        }
        self.open
    }
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        local_user_id: ME.to_string(),
        typing_debounce: Duration::from_secs(2),
        delete_window: Duration::from_secs(15 * 60),
    }
}

/// Engine already joined to `conversation_id`, with the join frames discarded.
pub fn joined_engine(conversation_id: &str, sink: &mut RecordingSink) -> ChatEngine {
    setup_logging();
    let mut engine = ChatEngine::new(settings(), Some(conversation_id.to_string()), Some(PEER.to_string()));
    engine.on_connected(sink);
    sink.take();
    engine
}

pub fn frame(value: Value) -> String {
    value.to_string()
}

pub fn ack_ok(request_id: &str, message_id: &str, created_at: &str) -> String {
    frame(json!({
        "type": "ack",
        "request_id": request_id,
        "ok": true,
        "data": { "message_id": message_id, "created_at": created_at }
    }))
}

pub fn message_sent(conversation_id: &str, id: &str, sender_id: &str, text: &str, created_at: &str) -> String {
    frame(json!({
        "type": "message.sent",
        "conversation_id": conversation_id,
        "message": {
            "id": id,
            "sender_id": sender_id,
            "text": text,
            "created_at": created_at
        }
    }))
}

pub fn presence_updated(user_id: &str, is_online: bool) -> String {
    frame(json!({
        "type": "presence.updated",
        "user_id": user_id,
        "is_online": is_online
    }))
}
