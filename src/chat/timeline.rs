// Ordered, deduplicated message list for one conversation

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::models::{Message, MessageStatus};

/// Result of merging one entry.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Default, Clone)]
pub struct Timeline {
    messages: Vec<Message>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn newest(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    /// Insert `message`, or upgrade the existing entry with the same id, then re-sort.
    ///
    /// Upgrades never regress status and never resurrect a deleted entry, so
    /// replaying the same event is a no-op.
    pub fn merge(&mut self, message: Message) -> MergeOutcome {
        let outcome = match self.position(&message.id) {
            Some(index) => {
                if upgrade(&mut self.messages[index], message) {
                    MergeOutcome::Updated
                } else {
                    MergeOutcome::Unchanged
                }
            }
            None => {
                self.messages.push(message);
                MergeOutcome::Inserted
            }
        };
        if outcome != MergeOutcome::Unchanged {
            self.sort();
        }
        outcome
    }

    /// Merge a batch (history page) with a single sort at the end.
    pub fn merge_all(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        let mut inserted = 0;
        for message in messages {
            match self.position(&message.id) {
                Some(index) => {
                    upgrade(&mut self.messages[index], message);
                }
                None => {
                    self.messages.push(message);
                    inserted += 1;
                }
            }
        }
        self.sort();
        inserted
    }

    /// Replace a pending entry's id and timestamp in place and mark it sent.
    ///
    /// If `new_id` is already present (its broadcast won the race) the pending
    /// entry is folded into it instead, keeping one entry per final id.
    pub fn confirm(&mut self, pending_id: &str, new_id: &str, created_at: Option<DateTime<Utc>>) -> bool {
        let Some(index) = self.position(pending_id) else {
            debug!("No pending entry '{}' to confirm", pending_id);
            return false;
        };

        if pending_id != new_id {
            if let Some(existing) = self.position(new_id) {
                let pending = self.messages.remove(index);
                let existing = if existing > index { existing - 1 } else { existing };
                let target = &mut self.messages[existing];
                target.is_own = true;
                if target.attachment.is_none() {
                    target.attachment = pending.attachment;
                }
                target.advance_status(MessageStatus::Sent);
                info!("Folded pending entry {} into already-known {}", pending_id, new_id);
                return true;
            }
        }

        let entry = &mut self.messages[index];
        entry.id = new_id.to_string();
        if let Some(ts) = created_at {
            entry.created_at = Some(ts);
        }
        entry.advance_status(MessageStatus::Sent);
        self.sort();
        true
    }

    /// Set an entry's status if that is a forward transition.
    pub fn set_status(&mut self, id: &str, status: MessageStatus) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => message.advance_status(status),
            None => false,
        }
    }

    /// Soft delete. Returns false when the id is unknown.
    pub fn mark_deleted(&mut self, id: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                message.deleted_for_everyone = true;
                true
            }
            None => false,
        }
    }

    /// Own `sent` messages at or before `last_read_at` (or without a timestamp) become `read`.
    /// Returns how many changed.
    pub fn apply_read_receipt(&mut self, last_read_at: DateTime<Utc>) -> usize {
        let mut changed = 0;
        for message in self.messages.iter_mut() {
            if !message.is_own || message.status != MessageStatus::Sent {
                continue;
            }
            let covered = match message.created_at {
                Some(ts) => ts <= last_read_at,
                None => true,
            };
            if covered && message.advance_status(MessageStatus::Read) {
                changed += 1;
            }
        }
        changed
    }

    /// Ascending by timestamp; stable, so ties keep their prior order.
    /// Entries without a timestamp sort after every timestamped entry.
    fn sort(&mut self) {
        self.messages.sort_by(|a, b| match (a.created_at, b.created_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
    }
}

// Fold `incoming` into `existing`. Returns whether anything changed.
fn upgrade(existing: &mut Message, incoming: Message) -> bool {
    let mut changed = false;
    if existing.advance_status(incoming.status) {
        changed = true;
    }
    if incoming.deleted_for_everyone && !existing.deleted_for_everyone {
        existing.deleted_for_everyone = true;
        changed = true;
    }
    if existing.created_at.is_none() && incoming.created_at.is_some() {
        existing.created_at = incoming.created_at;
        changed = true;
    }
    if existing.attachment.is_none() && incoming.attachment.is_some() {
        existing.attachment = incoming.attachment;
        changed = true;
    }
    if existing.shared_reference.is_none() && incoming.shared_reference.is_some() {
        existing.shared_reference = incoming.shared_reference;
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    fn msg(id: &str, ts: Option<DateTime<Utc>>, own: bool, status: MessageStatus) -> Message {
        Message {
            id: id.to_string(),
            sender_id: if own { "me" } else { "them" }.to_string(),
            text: format!("text {}", id),
            created_at: ts,
            is_own: own,
            status,
            deleted_for_everyone: false,
            attachment: None,
            shared_reference: None,
        }
    }

    fn ids(timeline: &Timeline) -> Vec<&str> {
        timeline.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_out_of_order_arrival_is_sorted() {
        let mut timeline = Timeline::new();
        timeline.merge(msg("A", Some(at(10, 0, 5)), false, MessageStatus::Sent));
        timeline.merge(msg("B", Some(at(10, 0, 2)), false, MessageStatus::Sent));
        assert_eq!(ids(&timeline), vec!["B", "A"]);
    }

    #[test]
    fn test_duplicate_merge_is_noop() {
        let mut timeline = Timeline::new();
        let a = msg("A", Some(at(10, 0, 0)), false, MessageStatus::Sent);
        assert_eq!(timeline.merge(a.clone()), MergeOutcome::Inserted);
        assert_eq!(timeline.merge(a), MergeOutcome::Unchanged);
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut timeline = Timeline::new();
        timeline.merge(msg("first", Some(at(9, 0, 0)), false, MessageStatus::Sent));
        timeline.merge(msg("second", Some(at(9, 0, 0)), false, MessageStatus::Sent));
        timeline.merge(msg("earlier", Some(at(8, 0, 0)), false, MessageStatus::Sent));
        assert_eq!(ids(&timeline), vec!["earlier", "first", "second"]);
    }

    #[test]
    fn test_merge_never_regresses_status() {
        let mut timeline = Timeline::new();
        timeline.merge(msg("A", Some(at(9, 0, 0)), true, MessageStatus::Read));
        assert_eq!(timeline.merge(msg("A", Some(at(9, 0, 0)), true, MessageStatus::Sent)), MergeOutcome::Unchanged);
        assert_eq!(timeline.get("A").unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn test_confirm_rekeys_in_place() {
        let mut timeline = Timeline::new();
        timeline.merge(msg("old", Some(at(9, 0, 0)), false, MessageStatus::Sent));
        timeline.merge(msg("R", Some(at(10, 0, 0)), true, MessageStatus::Sending));
        assert!(timeline.confirm("R", "abc", Some(at(10, 5, 0))));
        assert_eq!(ids(&timeline), vec!["old", "abc"]);
        let entry = timeline.get("abc").unwrap();
        assert_eq!(entry.status, MessageStatus::Sent);
        assert_eq!(entry.created_at, Some(at(10, 5, 0)));
        assert!(!timeline.contains("R"));
    }

    #[test]
    fn test_confirm_folds_into_existing_broadcast() {
        let mut timeline = Timeline::new();
        timeline.merge(msg("R", Some(at(10, 0, 0)), true, MessageStatus::Sending));
        timeline.merge(msg("abc", Some(at(10, 0, 1)), true, MessageStatus::Sent));
        assert!(timeline.confirm("R", "abc", None));
        assert_eq!(ids(&timeline), vec!["abc"]);
    }

    #[test]
    fn test_read_receipt_rule() {
        let mut timeline = Timeline::new();
        timeline.merge(msg("X", Some(at(9, 59, 59)), true, MessageStatus::Sent));
        timeline.merge(msg("Y", Some(at(10, 0, 1)), true, MessageStatus::Sent));
        timeline.merge(msg("Z", Some(at(9, 0, 0)), false, MessageStatus::Sent));
        timeline.merge(msg("P", Some(at(9, 30, 0)), true, MessageStatus::Sending));

        assert_eq!(timeline.apply_read_receipt(at(10, 0, 0)), 1);
        assert_eq!(timeline.get("X").unwrap().status, MessageStatus::Read);
        assert_eq!(timeline.get("Y").unwrap().status, MessageStatus::Sent);
        // Not own, and still pending: untouched
        assert_eq!(timeline.get("Z").unwrap().status, MessageStatus::Sent);
        assert_eq!(timeline.get("P").unwrap().status, MessageStatus::Sending);

        // Reapplying an older receipt changes nothing
        assert_eq!(timeline.apply_read_receipt(at(9, 0, 0)), 0);
        assert_eq!(timeline.get("X").unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn test_read_receipt_covers_untimestamped() {
        let mut timeline = Timeline::new();
        timeline.merge(msg("N", None, true, MessageStatus::Sent));
        assert_eq!(timeline.apply_read_receipt(at(0, 0, 0)), 1);
    }

    #[test]
    fn test_soft_delete_keeps_slot() {
        let mut timeline = Timeline::new();
        timeline.merge(msg("A", Some(at(9, 0, 0)), false, MessageStatus::Sent));
        assert!(timeline.mark_deleted("A"));
        assert!(!timeline.mark_deleted("missing"));
        assert_eq!(timeline.len(), 1);
        let entry = timeline.get("A").unwrap();
        assert!(entry.visible_text().is_none());

        // A later replay of the original broadcast does not undelete
        timeline.merge(msg("A", Some(at(9, 0, 0)), false, MessageStatus::Sent));
        assert!(timeline.get("A").unwrap().deleted_for_everyone);
    }
}
