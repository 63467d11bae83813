// Presence tracking for the joined conversation

use log::debug;
use std::collections::HashMap;

use super::protocol::{PresenceDelta, PresenceSnapshot};
use crate::models::PresenceRecord;

#[derive(Debug, Default)]
pub struct PresenceTracker {
    records: HashMap<String, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether anyone other than `local_user_id` is known to be online.
    pub fn any_counterpart_online(&self, local_user_id: &str) -> bool {
        self.records
            .values()
            .any(|r| r.is_online && r.user_id != local_user_id)
    }

    pub fn display_name(&self, user_id: &str) -> Option<&str> {
        self.records.get(user_id).and_then(|r| r.display_name.as_deref())
    }

    /// Merge a full snapshot. Users absent from the snapshot are kept.
    pub fn apply_snapshot(&mut self, snapshot: &PresenceSnapshot) -> usize {
        for user in &snapshot.users {
            self.merge(user);
        }
        debug!("Presence snapshot merged {} users", snapshot.users.len());
        snapshot.users.len()
    }

    /// Update one user. `display_name` and `last_seen` are only replaced when present.
    pub fn apply_delta(&mut self, delta: &PresenceDelta) {
        self.merge(delta);
    }

    fn merge(&mut self, delta: &PresenceDelta) {
        let record = self
            .records
            .entry(delta.user_id.clone())
            .or_insert_with(|| PresenceRecord {
                user_id: delta.user_id.clone(),
                display_name: None,
                is_online: false,
                last_seen: None,
            });
        record.is_online = delta.is_online;
        if delta.display_name.is_some() {
            record.display_name = delta.display_name.clone();
        }
        if delta.last_seen.is_some() {
            record.last_seen = delta.last_seen;
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::protocol::parse_timestamp;

    fn delta(user: &str, online: bool) -> PresenceDelta {
        PresenceDelta {
            conversation_id: None,
            user_id: user.to_string(),
            display_name: None,
            is_online: online,
            last_seen: None,
        }
    }

    #[test]
    fn test_delta_preserves_omitted_fields() {
        let mut tracker = PresenceTracker::new();
        let seen = parse_timestamp("2024-01-01T09:00:00Z");
        tracker.apply_snapshot(&PresenceSnapshot {
            conversation_id: Some("c1".to_string()),
            users: vec![PresenceDelta {
                display_name: Some("Ann".to_string()),
                last_seen: seen,
                ..delta("u1", true)
            }],
        });

        tracker.apply_delta(&delta("u1", false));
        let record = tracker.get("u1").unwrap();
        assert!(!record.is_online);
        assert_eq!(record.last_seen, seen);
        assert_eq!(record.display_name.as_deref(), Some("Ann"));
    }

    #[test]
    fn test_one_record_per_user() {
        let mut tracker = PresenceTracker::new();
        tracker.apply_delta(&delta("u1", true));
        tracker.apply_delta(&delta("u1", false));
        tracker.apply_delta(&delta("u2", true));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_counterpart_online_excludes_self() {
        let mut tracker = PresenceTracker::new();
        tracker.apply_delta(&delta("me", true));
        assert!(!tracker.any_counterpart_online("me"));
        tracker.apply_delta(&delta("u1", true));
        assert!(tracker.any_counterpart_online("me"));
    }
}
