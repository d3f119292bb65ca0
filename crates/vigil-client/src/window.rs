//! The ordered message window.
//!
//! [`MessageWindow`] is the only mutation surface for the messages a
//! conversation view displays. Every operation keeps two invariants:
//! identifiers are unique, and entries are sorted by creation time with
//! ties broken by identifier.

use std::collections::HashSet;

use tracing::trace;

use vigil_shared::types::{ConversationId, MessageId, MessageScope};
use vigil_store::Message;

/// A contiguous-from-the-newest-end slice of one conversation, oldest first.
#[derive(Debug, Clone, Default)]
pub struct MessageWindow {
    conversation_id: Option<ConversationId>,
    scope: MessageScope,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    has_more: bool,
    cursor: u32,
}

impl MessageWindow {
    pub fn new(conversation_id: Option<ConversationId>, scope: MessageScope) -> Self {
        Self {
            conversation_id,
            scope,
            ..Self::default()
        }
    }

    /// Empty the window and retarget it.
    pub fn reset(&mut self, conversation_id: Option<ConversationId>, scope: MessageScope) {
        self.conversation_id = conversation_id;
        self.scope = scope;
        self.clear();
    }

    /// Drop every message but keep the target.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
        self.has_more = false;
        self.cursor = 0;
    }

    /// Install the first page. `page` arrives newest first.
    ///
    /// Entries already delivered live since the last reset are kept.
    pub fn seed(&mut self, page: Vec<Message>, requested: u32) {
        let returned = page.len() as u32;

        for message in page.into_iter().rev() {
            self.insert_sorted(message);
        }

        self.has_more = returned == requested;
        self.cursor = returned;
    }

    /// Merge an older page at the head. Returns how many entries were added.
    ///
    /// `has_more` and the cursor follow what the backend returned, even when
    /// some entries were already present.
    pub fn prepend_older(&mut self, page: Vec<Message>, requested: u32) -> usize {
        let returned = page.len() as u32;
        let mut added = 0;

        for message in page.into_iter().rev() {
            if self.insert_sorted(message) {
                added += 1;
            }
        }

        self.has_more = returned == requested;
        self.cursor = self.cursor.saturating_add(returned);
        added
    }

    /// Insert a new message. Already-present identifiers are ignored, which
    /// absorbs duplicate delivery (local send echoed by the live stream).
    pub fn append_newest(&mut self, message: Message) -> bool {
        let inserted = self.insert_sorted(message);
        if inserted {
            // The backend's newest-first offsets shifted by one.
            self.cursor = self.cursor.saturating_add(1);
        }
        inserted
    }

    /// Replace the entry with the same identifier. Unknown identifiers are
    /// ignored; an update that carries a deletion removes the entry.
    pub fn apply_update(&mut self, message: Message) -> bool {
        let Some(index) = self.position(message.id) else {
            trace!(id = %message.id, "update for message outside the window");
            return false;
        };

        if message.is_deleted() || !self.scope.admits_parent(message.parent_id) {
            return self.apply_delete(message.id).is_some();
        }

        let before = self.messages[index].sort_key();
        self.messages[index].merge_update(message);

        if self.messages[index].sort_key() != before {
            let moved = self.messages.remove(index);
            let at = self.insertion_point(&moved);
            self.messages.insert(at, moved);
        }
        true
    }

    /// Remove the entry with `id`, if present.
    pub fn apply_delete(&mut self, id: MessageId) -> Option<Message> {
        if !self.ids.remove(&id) {
            return None;
        }
        let index = self.messages.iter().position(|m| m.id == id)?;
        self.cursor = self.cursor.saturating_sub(1);
        Some(self.messages.remove(index))
    }

    /// Shift the displayed reply count of `parent` by `delta`, clamped at
    /// zero. Returns whether the parent is in the window.
    pub fn adjust_reply_count(&mut self, parent: MessageId, delta: i64) -> bool {
        let Some(index) = self.position(parent) else {
            return false;
        };
        let entry = &mut self.messages[index];
        let next = (i64::from(entry.reply_count) + delta).clamp(0, i64::from(u32::MAX));
        entry.reply_count = next as u32;
        true
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.position(id).map(|i| &self.messages[i])
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether older messages remain in the backend.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Offset of the next older page.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    pub fn scope(&self) -> MessageScope {
        self.scope
    }

    /// Whether `message` may live in this window at all.
    pub fn admits(&self, message: &Message) -> bool {
        !message.is_deleted()
            && self.scope.admits_parent(message.parent_id)
            && self
                .conversation_id
                .map_or(true, |id| id == message.conversation_id)
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        if !self.ids.contains(&id) {
            return None;
        }
        self.messages.iter().position(|m| m.id == id)
    }

    fn insertion_point(&self, message: &Message) -> usize {
        let key = message.sort_key();
        self.messages.partition_point(|m| m.sort_key() <= key)
    }

    fn insert_sorted(&mut self, message: Message) -> bool {
        if !self.admits(&message) {
            trace!(id = %message.id, "message not admitted to window");
            return false;
        }
        if !self.ids.insert(message.id) {
            return false;
        }

        let at = self.insertion_point(&message);
        self.messages.insert(at, message);
        true
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use vigil_shared::types::{ContentKind, UserId};

    use super::*;

    fn ts(t: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::seconds(t)
    }

    fn msg(conversation: ConversationId, t: i64) -> Message {
        Message {
            id: MessageId::new(),
            conversation_id: conversation,
            sender_id: UserId::new(),
            kind: ContentKind::Text,
            content: format!("t={t}"),
            parent_id: None,
            is_restricted: false,
            created_at: ts(t),
            updated_at: ts(t),
            deleted_at: None,
            reply_count: 0,
            sender: None,
        }
    }

    fn ids(window: &MessageWindow) -> Vec<MessageId> {
        window.messages().iter().map(|m| m.id).collect()
    }

    fn assert_invariants(window: &MessageWindow) {
        let unique: HashSet<MessageId> = window.messages().iter().map(|m| m.id).collect();
        assert_eq!(unique.len(), window.len(), "duplicate identifiers");
        assert!(
            window
                .messages()
                .windows(2)
                .all(|pair| pair[0].sort_key() <= pair[1].sort_key()),
            "window out of order"
        );
    }

    #[test]
    fn seed_then_append() {
        let c = ConversationId::new();
        let (m1, m2, m3) = (msg(c, 1), msg(c, 2), msg(c, 3));
        let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);

        // Pages arrive newest first.
        window.seed(vec![m2.clone(), m1.clone()], 50);
        assert!(window.append_newest(m3.clone()));

        assert_eq!(ids(&window), vec![m1.id, m2.id, m3.id]);
        assert!(!window.has_more());
    }

    #[test]
    fn seed_keeps_messages_delivered_live() {
        let c = ConversationId::new();
        let (m1, m2, m3) = (msg(c, 1), msg(c, 2), msg(c, 3));
        let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);

        window.append_newest(m3.clone());
        window.seed(vec![m3.clone(), m2.clone(), m1.clone()], 3);

        assert_eq!(ids(&window), vec![m1.id, m2.id, m3.id]);
        assert!(window.has_more());
        assert_eq!(window.cursor(), 3);
    }

    #[test]
    fn duplicate_send_and_receive_is_idempotent() {
        let c = ConversationId::new();
        let m1 = msg(c, 1);
        let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);
        window.seed(vec![m1.clone()], 50);

        assert!(!window.append_newest(m1.clone()));
        assert!(!window.append_newest(m1.clone()));
        assert_eq!(window.len(), 1);
        assert_eq!(window.cursor(), 1);
    }

    #[test]
    fn backward_page_lands_at_head() {
        let c = ConversationId::new();
        let (m3, m4, m5, m6) = (msg(c, 3), msg(c, 4), msg(c, 5), msg(c, 6));
        let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);

        window.seed(vec![m6.clone(), m5.clone()], 2);
        assert!(window.has_more());
        assert_eq!(window.cursor(), 2);

        let added = window.prepend_older(vec![m4.clone(), m3.clone()], 2);
        assert_eq!(added, 2);
        assert_eq!(ids(&window), vec![m3.id, m4.id, m5.id, m6.id]);
        assert!(window.has_more());
        assert_eq!(window.cursor(), 4);

        window.prepend_older(vec![], 2);
        assert!(!window.has_more());
        assert_eq!(window.cursor(), 4);
    }

    #[test]
    fn older_page_resolving_after_live_insert_still_merges_at_head() {
        let c = ConversationId::new();
        let (m1, m2, m3, m4) = (msg(c, 1), msg(c, 2), msg(c, 3), msg(c, 4));
        let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);

        window.seed(vec![m3.clone()], 1);
        window.append_newest(m4.clone());
        window.prepend_older(vec![m2.clone(), m1.clone()], 2);

        assert_eq!(ids(&window), vec![m1.id, m2.id, m3.id, m4.id]);
    }

    #[test]
    fn overlapping_page_is_deduplicated() {
        let c = ConversationId::new();
        let (m1, m2, m3) = (msg(c, 1), msg(c, 2), msg(c, 3));
        let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);

        window.seed(vec![m3.clone(), m2.clone()], 2);
        let added = window.prepend_older(vec![m2.clone(), m1.clone()], 2);

        assert_eq!(added, 1);
        assert_eq!(ids(&window), vec![m1.id, m2.id, m3.id]);
    }

    #[test]
    fn ties_are_broken_by_identifier() {
        let c = ConversationId::new();
        let a = msg(c, 7);
        let mut b = msg(c, 7);
        b.created_at = a.created_at;
        let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);

        window.append_newest(b.clone());
        window.append_newest(a.clone());

        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids(&window), expected);
    }

    #[test]
    fn update_replaces_in_place_and_ignores_unknown() {
        let c = ConversationId::new();
        let (m1, m2) = (msg(c, 1), msg(c, 2));
        let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);
        window.seed(vec![m2.clone(), m1.clone()], 50);

        let mut edited = m1.clone();
        edited.content = "edited".into();
        assert!(window.apply_update(edited));
        assert_eq!(window.get(m1.id).unwrap().content, "edited");
        assert_eq!(ids(&window), vec![m1.id, m2.id]);

        assert!(!window.apply_update(msg(c, 3)));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn soft_deleting_update_removes_entry() {
        let c = ConversationId::new();
        let m1 = msg(c, 1);
        let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);
        window.seed(vec![m1.clone()], 50);

        let mut deleted = m1.clone();
        deleted.deleted_at = Some(ts(10));
        assert!(window.apply_update(deleted));
        assert!(window.is_empty());
    }

    #[test]
    fn update_then_delete_converges() {
        let c = ConversationId::new();
        let (m1, m2, m3) = (msg(c, 1), msg(c, 2), msg(c, 3));
        let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);
        window.seed(vec![m2.clone(), m1.clone()], 50);

        let mut edited = m1.clone();
        edited.content = "edited".into();
        window.apply_update(edited);
        window.append_newest(m3.clone());
        window.apply_delete(m2.id);
        assert!(window.apply_delete(m1.id).is_some());

        assert!(!window.contains(m1.id));
        assert!(window.apply_delete(m1.id).is_none());
        assert_eq!(ids(&window), vec![m3.id]);
    }

    #[test]
    fn rejects_foreign_replies_and_deleted_messages() {
        let c = ConversationId::new();
        let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);

        let foreign = msg(ConversationId::new(), 1);
        let mut reply = msg(c, 2);
        reply.parent_id = Some(MessageId::new());
        let mut deleted = msg(c, 3);
        deleted.deleted_at = Some(ts(4));

        assert!(!window.append_newest(foreign));
        assert!(!window.append_newest(reply));
        assert!(!window.append_newest(deleted));
        assert!(window.is_empty());
    }

    #[test]
    fn thread_scope_holds_replies_of_one_parent() {
        let c = ConversationId::new();
        let parent = msg(c, 0);
        let mut window = MessageWindow::new(Some(c), MessageScope::Replies(parent.id));

        let mut reply = msg(c, 1);
        reply.parent_id = Some(parent.id);
        let mut reply_to_reply = msg(c, 2);
        reply_to_reply.parent_id = Some(reply.id);

        assert!(!window.append_newest(parent.clone()));
        assert!(window.append_newest(reply.clone()));
        assert!(!window.append_newest(reply_to_reply));
        assert_eq!(ids(&window), vec![reply.id]);
    }

    #[test]
    fn reply_count_adjustments_clamp_at_zero() {
        let c = ConversationId::new();
        let m1 = msg(c, 1);
        let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);
        window.seed(vec![m1.clone()], 50);

        assert!(window.adjust_reply_count(m1.id, 1));
        assert_eq!(window.get(m1.id).unwrap().reply_count, 1);
        assert!(window.adjust_reply_count(m1.id, -3));
        assert_eq!(window.get(m1.id).unwrap().reply_count, 0);
        assert!(!window.adjust_reply_count(MessageId::new(), 1));
    }

    #[test]
    fn invariants_hold_under_random_operation_sequences() {
        let c = ConversationId::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..50 {
            let pool: Vec<Message> = (0..40).map(|_| msg(c, rng.gen_range(0..20))).collect();
            let mut window = MessageWindow::new(Some(c), MessageScope::TopLevel);

            let mut seed: Vec<Message> = pool[..5].to_vec();
            seed.shuffle(&mut rng);
            window.seed(seed, 5);
            assert_invariants(&window);

            for _ in 0..60 {
                let pick = pool[rng.gen_range(0..pool.len())].clone();
                match rng.gen_range(0..4) {
                    0 => {
                        window.append_newest(pick);
                    }
                    1 => {
                        let mut page: Vec<Message> = (0..3)
                            .map(|_| pool[rng.gen_range(0..pool.len())].clone())
                            .collect();
                        page.shuffle(&mut rng);
                        window.prepend_older(page, 3);
                    }
                    2 => {
                        let mut edited = pick;
                        edited.created_at = ts(rng.gen_range(0..20));
                        window.apply_update(edited);
                    }
                    _ => {
                        window.apply_delete(pick.id);
                    }
                }
                assert_invariants(&window);
            }
        }
    }
}
