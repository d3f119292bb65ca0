//! Conversation list synchronization.
//!
//! [`ConversationList`] holds one row per conversation the viewer belongs to
//! and folds live inserts from every conversation into previews and unread
//! counts. [`ConversationListSync`] runs it in a task subscribed to the
//! all-conversations feed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use vigil_shared::constants::PREVIEW_MAX_CHARS;
use vigil_shared::protocol::{ChangeEvent, FeedTopic, MessageRow};
use vigil_shared::types::{ContentKind, ConversationId, ConversationKind, MessageId, TenantId, UserId};
use vigil_store::{ConversationOverview, Message};

use crate::backend::{ChangeFeed, ConversationSource, FeedItem};
use crate::error::SyncError;
use crate::events::{report_error, ErrorHook};
use crate::reconciler::FeedConnection;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastMessagePreview {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub kind: ContentKind,
    pub snippet: String,
    pub created_at: DateTime<Utc>,
}

impl LastMessagePreview {
    fn new(id: MessageId, sender_id: UserId, kind: ContentKind, content: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            message_id: id,
            sender_id,
            kind,
            snippet: snippet(kind, content),
            created_at,
        }
    }

    fn from_message(message: &Message) -> Self {
        Self::new(
            message.id,
            message.sender_id,
            message.kind,
            &message.content,
            message.created_at,
        )
    }

    fn from_row(row: &MessageRow) -> Self {
        Self::new(row.id, row.sender_id, row.kind, &row.content, row.created_at)
    }

    fn key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.message_id)
    }
}

fn snippet(kind: ContentKind, content: &str) -> String {
    match kind {
        ContentKind::Image => return "Photo".to_string(),
        ContentKind::PrayerCard if content.trim().is_empty() => return "Prayer request".to_string(),
        _ => {}
    }

    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_MAX_CHARS {
        return flat;
    }
    let mut cut: String = flat.chars().take(PREVIEW_MAX_CHARS - 1).collect();
    cut.push('…');
    cut
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub display_name: String,
    pub last_message: Option<LastMessagePreview>,
    pub unread_count: u32,
    pub last_read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ConversationSummary {
    pub fn from_overview(overview: &ConversationOverview, viewer: UserId) -> Self {
        let conversation = &overview.conversation;
        Self {
            id: conversation.id,
            kind: conversation.kind,
            display_name: conversation.display_name(&overview.participants, viewer),
            last_message: overview.last_message.as_ref().map(LastMessagePreview::from_message),
            unread_count: overview.unread_count,
            last_read_at: overview.last_read_at,
            created_at: conversation.created_at,
        }
    }

    /// Newest activity: the last message, or creation for an empty conversation.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map_or(self.created_at, |m| m.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Applied,
    Ignored,
    /// The insert belongs to a conversation the list does not know yet.
    UnknownConversation,
}

#[derive(Debug, Clone)]
pub struct ConversationList {
    viewer: UserId,
    active: Option<ConversationId>,
    rows: Vec<ConversationSummary>,
    seen: HashSet<MessageId>,
    /// Newest message each seeded row already accounts for.
    seeded: HashMap<ConversationId, (DateTime<Utc>, MessageId)>,
}

impl ConversationList {
    pub fn new(viewer: UserId) -> Self {
        Self {
            viewer,
            active: None,
            rows: Vec::new(),
            seen: HashSet::new(),
            seeded: HashMap::new(),
        }
    }

    /// Replace every row. Inserts at or before a row's seeded last message
    /// are already part of its unread count and are ignored afterwards.
    pub fn seed(&mut self, overviews: &[ConversationOverview]) {
        self.rows = overviews
            .iter()
            .map(|o| ConversationSummary::from_overview(o, self.viewer))
            .collect();
        self.seeded = self
            .rows
            .iter()
            .filter_map(|r| r.last_message.as_ref().map(|m| (r.id, m.key())))
            .collect();
        self.seen = self.seeded.values().map(|(_, id)| *id).collect();
        self.sort();
    }

    /// The conversation currently open, whose messages never count as unread.
    pub fn set_active(&mut self, conversation_id: Option<ConversationId>) {
        self.active = conversation_id;
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.active
    }

    pub fn apply_insert(&mut self, row: &MessageRow) -> InsertOutcome {
        if row.parent_id.is_some() || row.is_deleted() {
            return InsertOutcome::Ignored;
        }

        let viewer = self.viewer;
        let active = self.active;
        let Some(summary) = self.rows.iter_mut().find(|r| r.id == row.conversation_id) else {
            return InsertOutcome::UnknownConversation;
        };
        if !self.seen.insert(row.id) {
            return InsertOutcome::Ignored;
        }
        if self
            .seeded
            .get(&row.conversation_id)
            .is_some_and(|seeded| (row.created_at, row.id) <= *seeded)
        {
            return InsertOutcome::Ignored;
        }

        let preview = LastMessagePreview::from_row(row);
        if summary
            .last_message
            .as_ref()
            .map_or(true, |current| preview.key() > current.key())
        {
            summary.last_message = Some(preview);
        }

        let unread = row.sender_id != viewer
            && active != Some(row.conversation_id)
            && summary.last_read_at.map_or(true, |read| row.created_at > read);
        if unread {
            summary.unread_count += 1;
        }

        self.sort();
        InsertOutcome::Applied
    }

    /// Zero the unread count and move the read marker forward to `at`.
    pub fn mark_read(&mut self, conversation_id: ConversationId, at: DateTime<Utc>) -> bool {
        let Some(summary) = self.rows.iter_mut().find(|r| r.id == conversation_id) else {
            return false;
        };
        summary.unread_count = 0;
        summary.last_read_at = Some(summary.last_read_at.map_or(at, |read| read.max(at)));
        true
    }

    pub fn rows(&self) -> &[ConversationSummary] {
        &self.rows
    }

    pub fn get(&self, id: ConversationId) -> Option<&ConversationSummary> {
        self.rows.iter().find(|r| r.id == id)
    }

    pub fn total_unread(&self) -> u32 {
        self.rows.iter().map(|r| r.unread_count).sum()
    }

    fn sort(&mut self) {
        self.rows.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then_with(|| b.id.cmp(&a.id))
        });
    }
}

// ---------------------------------------------------------------------------
// Sync task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationListSnapshot {
    pub conversations: Vec<ConversationSummary>,
    pub loading: bool,
    pub error: Option<String>,
    pub revision: u64,
}

#[derive(Debug)]
enum ListCommand {
    SetActive(Option<ConversationId>),
    MarkRead(ConversationId),
    Refresh,
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct ConversationListHandle {
    commands: mpsc::Sender<ListCommand>,
    snapshots: watch::Receiver<ConversationListSnapshot>,
}

impl ConversationListHandle {
    async fn send(&self, command: ListCommand) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::SessionClosed)
    }

    pub async fn set_active(&self, conversation_id: Option<ConversationId>) -> Result<(), SyncError> {
        self.send(ListCommand::SetActive(conversation_id)).await
    }

    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        self.send(ListCommand::MarkRead(conversation_id)).await
    }

    pub async fn refresh(&self) -> Result<(), SyncError> {
        self.send(ListCommand::Refresh).await
    }

    pub fn snapshot(&self) -> ConversationListSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConversationListSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until every queued command and notification has been handled.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(ListCommand::Flush(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(ListCommand::Shutdown(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }
}

pub struct ConversationListSync {
    source: Arc<dyn ConversationSource>,
    connection: FeedConnection,
    on_error: ErrorHook,
    viewer: UserId,
    tenant_id: TenantId,
    list: ConversationList,
    error: Option<String>,
    loading: bool,
    revision: u64,
    commands: mpsc::Receiver<ListCommand>,
    snapshot_tx: watch::Sender<ConversationListSnapshot>,
}

impl ConversationListSync {
    pub fn spawn(
        source: Arc<dyn ConversationSource>,
        feed: Arc<dyn ChangeFeed>,
        viewer: UserId,
        tenant_id: TenantId,
        capacity: usize,
        on_error: ErrorHook,
    ) -> ConversationListHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(ConversationListSnapshot {
            loading: true,
            ..ConversationListSnapshot::default()
        });

        let sync = Self {
            source,
            connection: FeedConnection::new(feed),
            on_error,
            viewer,
            tenant_id,
            list: ConversationList::new(viewer),
            error: None,
            loading: true,
            revision: 0,
            commands: cmd_rx,
            snapshot_tx,
        };
        tokio::spawn(sync.run());

        ConversationListHandle {
            commands: cmd_tx,
            snapshots: snapshot_rx,
        }
    }

    async fn run(mut self) {
        info!(viewer = %self.viewer, "Conversation list sync started");

        // Subscribe first so nothing sent during the initial load is missed.
        if let Err(source) = self.connection.attach(FeedTopic::AllConversations).await {
            report_error(
                &self.on_error,
                SyncError::Subscribe {
                    topic: FeedTopic::AllConversations.name(),
                    source,
                },
            );
        }
        self.refresh().await;

        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ListCommand::Shutdown(reply)) => {
                            shutdown_reply = Some(reply);
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }

                item = self.connection.next_item() => {
                    self.handle_feed_item(item).await;
                }
            }
        }

        self.commands.close();
        self.connection.detach().await;
        info!("Conversation list sync stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, command: ListCommand) {
        match command {
            ListCommand::SetActive(conversation_id) => {
                self.list.set_active(conversation_id);
            }
            ListCommand::MarkRead(conversation_id) => self.mark_read(conversation_id).await,
            ListCommand::Refresh => self.refresh().await,
            ListCommand::Flush(reply) => {
                while let Some(item) = self.connection.try_next() {
                    self.handle_feed_item(item).await;
                }
                let _ = reply.send(());
            }
            ListCommand::Shutdown(_) => {}
        }
    }

    async fn refresh(&mut self) {
        self.loading = true;
        self.publish();

        match self.source.list_conversations(self.viewer, self.tenant_id).await {
            Ok(overviews) => {
                debug!(count = overviews.len(), "Conversation list loaded");
                self.list.seed(&overviews);
                self.error = None;
            }
            Err(e) => {
                self.error = Some(e.to_string());
                report_error(&self.on_error, SyncError::ConversationList(e));
            }
        }

        self.loading = false;
        self.publish();
    }

    async fn mark_read(&mut self, conversation_id: ConversationId) {
        let at = Utc::now();
        if self.list.mark_read(conversation_id, at) {
            self.publish();
        }

        if let Err(e) = self.source.mark_read(conversation_id, self.viewer, at).await {
            report_error(&self.on_error, SyncError::MarkRead(e));
        }
    }

    async fn handle_feed_item(&mut self, item: Option<FeedItem>) {
        let topic = FeedTopic::AllConversations.name();

        match item {
            Some(FeedItem::Change(payload)) => match ChangeEvent::from_payload(&payload) {
                Ok(ChangeEvent::Insert { new }) => match self.list.apply_insert(&new) {
                    InsertOutcome::Applied => self.publish(),
                    InsertOutcome::UnknownConversation => {
                        debug!(conversation = %new.conversation_id, "Insert for unknown conversation, reloading");
                        self.refresh().await;
                    }
                    InsertOutcome::Ignored => {}
                },
                Ok(other) => debug!(kind = %other.kind(), "Ignoring non-insert on list channel"),
                Err(e) => report_error(&self.on_error, SyncError::Protocol(e)),
            },
            Some(FeedItem::Error(reason)) => {
                report_error(&self.on_error, SyncError::Channel { topic, reason });
            }
            None => {
                self.connection.detach().await;
                report_error(&self.on_error, SyncError::ChannelClosed(topic));
            }
        }
    }

    fn publish(&mut self) {
        self.revision += 1;
        self.snapshot_tx.send_replace(ConversationListSnapshot {
            conversations: self.list.rows().to_vec(),
            loading: self.loading,
            error: self.error.clone(),
            revision: self.revision,
        });
    }
}

#[cfg(test)]
mod tests {
    use vigil_store::{Conversation, User};

    use super::*;
    use crate::events::log_only;
    use crate::testing::{error_sink, insert_payload, message, reply, ts, FakeFeed, FakeSource};

    fn overview(kind: ConversationKind, name: Option<&str>, last: Option<Message>, t: i64) -> ConversationOverview {
        ConversationOverview {
            conversation: Conversation {
                id: last.as_ref().map_or_else(ConversationId::new, |m| m.conversation_id),
                tenant_id: TenantId::new(),
                kind,
                name: name.map(str::to_string),
                created_at: ts(t),
            },
            participants: vec![User {
                id: UserId::new(),
                display_name: Some("Naomi".into()),
                avatar_url: None,
                created_at: ts(0),
            }],
            last_message: last,
            unread_count: 0,
            last_read_at: None,
        }
    }

    fn row_in(conversation: ConversationId, t: i64) -> MessageRow {
        message(conversation, t).to_row()
    }

    #[test]
    fn seeds_and_sorts_by_last_activity() {
        let c1 = ConversationId::new();
        let older = overview(ConversationKind::SmallGroup, Some("Tuesday group"), Some(message(c1, 5)), 0);
        let empty_recent = overview(ConversationKind::Direct, None, None, 50);

        let mut list = ConversationList::new(UserId::new());
        list.seed(&[older, empty_recent.clone()]);

        assert_eq!(list.rows()[0].id, empty_recent.conversation.id);
        assert_eq!(list.rows()[0].display_name, "Naomi");
        assert_eq!(list.rows()[1].display_name, "Tuesday group");
    }

    #[test]
    fn foreign_insert_raises_unread_and_preview() {
        let c = ConversationId::new();
        let mut list = ConversationList::new(UserId::new());
        list.seed(&[overview(ConversationKind::Ministry, None, Some(message(c, 1)), 0)]);

        let row = row_in(c, 2);
        assert_eq!(list.apply_insert(&row), InsertOutcome::Applied);
        assert_eq!(list.apply_insert(&row), InsertOutcome::Ignored);

        let summary = list.get(c).unwrap();
        assert_eq!(summary.unread_count, 1);
        assert_eq!(summary.last_message.as_ref().map(|m| m.message_id), Some(row.id));
    }

    #[test]
    fn older_insert_keeps_newer_preview() {
        let c = ConversationId::new();
        let newest = message(c, 10);
        let mut list = ConversationList::new(UserId::new());
        list.seed(&[overview(ConversationKind::Ministry, None, Some(newest.clone()), 0)]);

        list.apply_insert(&row_in(c, 3));
        assert_eq!(
            list.get(c).unwrap().last_message.as_ref().map(|m| m.message_id),
            Some(newest.id)
        );
    }

    #[test]
    fn own_active_and_reply_messages_never_count() {
        let viewer = UserId::new();
        let (c1, c2) = (ConversationId::new(), ConversationId::new());
        let parent = message(c1, 1);
        let mut list = ConversationList::new(viewer);
        list.seed(&[
            overview(ConversationKind::Direct, None, Some(parent.clone()), 0),
            overview(ConversationKind::Direct, None, Some(message(c2, 1)), 0),
        ]);

        let mut own = row_in(c1, 2);
        own.sender_id = viewer;
        list.apply_insert(&own);

        let threaded = reply(&parent, 3).to_row();
        assert_eq!(list.apply_insert(&threaded), InsertOutcome::Ignored);

        list.set_active(Some(c2));
        list.apply_insert(&row_in(c2, 4));

        assert_eq!(list.total_unread(), 0);
        assert_eq!(
            list.get(c1).unwrap().last_message.as_ref().map(|m| m.message_id),
            Some(own.id)
        );
    }

    #[test]
    fn read_marker_suppresses_older_inserts_and_mark_read_resets() {
        let c = ConversationId::new();
        let mut list = ConversationList::new(UserId::new());
        list.seed(&[overview(ConversationKind::SmallGroup, None, Some(message(c, 1)), 0)]);

        list.apply_insert(&row_in(c, 5));
        assert!(list.mark_read(c, ts(10)));
        assert_eq!(list.get(c).unwrap().unread_count, 0);

        // A late delivery of something already read.
        list.apply_insert(&row_in(c, 8));
        assert_eq!(list.get(c).unwrap().unread_count, 0);

        list.apply_insert(&row_in(c, 12));
        assert_eq!(list.get(c).unwrap().unread_count, 1);

        // Markers never move back.
        list.mark_read(c, ts(2));
        assert_eq!(list.get(c).unwrap().last_read_at, Some(ts(10)));
    }

    #[test]
    fn inserts_covered_by_seed_are_not_counted_again() {
        let c = ConversationId::new();
        let queued: Vec<Message> = (1..=3).map(|t| message(c, t)).collect();
        let mut seeded = overview(ConversationKind::SmallGroup, None, Some(queued[2].clone()), 0);
        seeded.unread_count = 3;

        let mut list = ConversationList::new(UserId::new());
        list.seed(&[seeded]);
        for m in &queued {
            assert_eq!(list.apply_insert(&m.to_row()), InsertOutcome::Ignored);
        }
        assert_eq!(list.get(c).unwrap().unread_count, 3);

        list.apply_insert(&row_in(c, 4));
        assert_eq!(list.get(c).unwrap().unread_count, 4);
    }

    #[test]
    fn unknown_conversation_is_flagged() {
        let mut list = ConversationList::new(UserId::new());
        assert_eq!(
            list.apply_insert(&row_in(ConversationId::new(), 1)),
            InsertOutcome::UnknownConversation
        );
    }

    #[test]
    fn long_previews_are_shortened() {
        let long = "Lord, ".repeat(40);
        let s = snippet(ContentKind::Text, &long);
        assert_eq!(s.chars().count(), PREVIEW_MAX_CHARS);
        assert!(s.ends_with('…'));
        assert_eq!(snippet(ContentKind::Image, "storage/abc.jpg"), "Photo");
        assert_eq!(snippet(ContentKind::Text, "line one\n line two"), "line one line two");
    }

    #[tokio::test]
    async fn task_follows_all_conversations_feed() {
        let viewer = UserId::new();
        let c = ConversationId::new();
        let source = Arc::new(FakeSource::default());
        source.set_overviews(vec![overview(ConversationKind::SmallGroup, None, Some(message(c, 1)), 0)]);
        let feed = Arc::new(FakeFeed::default());

        let handle = ConversationListSync::spawn(
            source.clone(),
            feed.clone(),
            viewer,
            TenantId::new(),
            16,
            log_only(),
        );
        handle.flush().await.unwrap();
        assert!(!handle.snapshot().loading);
        assert_eq!(feed.log(), vec![format!("subscribe {}", FeedTopic::AllConversations)]);

        let incoming = message(c, 2);
        feed.push(FeedTopic::AllConversations, FeedItem::Change(insert_payload(&incoming)));
        handle.flush().await.unwrap();
        assert_eq!(handle.snapshot().conversations[0].unread_count, 1);

        handle.mark_read(c).await.unwrap();
        handle.flush().await.unwrap();
        assert_eq!(handle.snapshot().conversations[0].unread_count, 0);
        assert_eq!(source.marks(), vec![(c, viewer)]);

        handle.shutdown().await.unwrap();
        assert_eq!(feed.live_count(), 0);
    }

    #[tokio::test]
    async fn reload_for_new_conversation_does_not_double_count() {
        let viewer = UserId::new();
        let c = ConversationId::new();
        let source = Arc::new(FakeSource::default());
        let feed = Arc::new(FakeFeed::default());
        let handle = ConversationListSync::spawn(
            source.clone(),
            feed.clone(),
            viewer,
            TenantId::new(),
            16,
            log_only(),
        );
        handle.flush().await.unwrap();
        assert!(handle.snapshot().conversations.is_empty());

        // The backend already counts all three by the time the list reloads.
        let incoming: Vec<Message> = (1..=3).map(|t| message(c, t)).collect();
        let mut known = overview(ConversationKind::Direct, None, Some(incoming[2].clone()), 0);
        known.unread_count = 3;
        source.set_overviews(vec![known]);

        for m in &incoming {
            feed.push(FeedTopic::AllConversations, FeedItem::Change(insert_payload(m)));
        }
        handle.flush().await.unwrap();

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.conversations.len(), 1);
        assert_eq!(snapshot.conversations[0].unread_count, 3);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn closed_list_channel_is_reported_and_released() {
        let (hook, errors) = error_sink();
        let source = Arc::new(FakeSource::default());
        let feed = Arc::new(FakeFeed::default());
        let handle = ConversationListSync::spawn(
            source,
            feed.clone(),
            UserId::new(),
            TenantId::new(),
            16,
            hook,
        );
        handle.flush().await.unwrap();

        feed.close(FeedTopic::AllConversations);
        handle.flush().await.unwrap();

        let errors = errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("closed"));
        assert!(handle.refresh().await.is_ok());
        handle.shutdown().await.unwrap();
    }
}
