// Re-export needed modules for testing
pub mod chat;
pub mod collab;
pub mod config;
pub mod error;
pub mod models;

// Re-export main types for convenience
pub use chat::{ChatClient, ChatEngine, ClientUpdate, Command};
pub use error::{ChatError, ChatResult};
pub use models::*;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_status_only_moves_forward() {
        use MessageStatus::*;
        assert!(Sending.can_advance_to(Sent));
        assert!(Sending.can_advance_to(Read));
        assert!(Sent.can_advance_to(Read));
        assert!(Sending.can_advance_to(Error));

        assert!(!Read.can_advance_to(Sent));
        assert!(!Sent.can_advance_to(Sending));
        assert!(!Sent.can_advance_to(Error));
        assert!(!Read.can_advance_to(Read));
    }

    #[test]
    fn test_outgoing_message_defaults() {
        let msg = Message::outgoing("corr-1", "me", "Hello", Utc::now());
        assert_eq!(msg.id, "corr-1");
        assert!(msg.is_own);
        assert_eq!(msg.status, MessageStatus::Sending);
        assert!(!msg.deleted_for_everyone);
        assert_eq!(msg.visible_text(), Some("Hello"));
    }

    #[test]
    fn test_deleted_message_hides_content() {
        let mut msg = Message::outgoing("corr-2", "me", "secret", Utc::now());
        msg.attachment = Some(Attachment {
            url: "https://cdn/a.mp3".to_string(),
            kind: AttachmentKind::Audio,
            size: 1024,
            name: "a.mp3".to_string(),
        });
        msg.deleted_for_everyone = true;
        assert!(msg.visible_text().is_none());
        assert!(msg.visible_attachment().is_none());
        // Deletion does not touch delivery status
        assert!(msg.advance_status(MessageStatus::Sent));
    }
}
