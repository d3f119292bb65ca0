//! Live event reconciliation.
//!
//! [`FeedConnection`] owns at most one change-feed subscription and releases
//! it before opening another. [`LiveEventReconciler`] adds the translation of
//! raw notifications into [`LiveAction`]s that the session applies to its
//! window.

use std::sync::Arc;

use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, trace};

use vigil_shared::protocol::{ChangeEvent, FeedTopic};
use vigil_shared::types::{ConversationId, MessageId, MessageScope};
use vigil_shared::ProtocolError;
use vigil_store::Message;

use crate::backend::{ChangeFeed, FeedItem, FeedSubscription, SubscriptionId};
use crate::error::BackendError;

/// One live subscription at a time.
pub struct FeedConnection {
    feed: Arc<dyn ChangeFeed>,
    current: Option<FeedSubscription>,
}

impl FeedConnection {
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            feed,
            current: None,
        }
    }

    pub fn topic(&self) -> Option<FeedTopic> {
        self.current.as_ref().map(|s| s.topic)
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.current.as_ref().map(|s| s.id)
    }

    /// Subscribe to `topic`. Any previous subscription is fully released
    /// first, so two channels are never live together.
    pub async fn attach(&mut self, topic: FeedTopic) -> Result<SubscriptionId, BackendError> {
        self.detach().await;

        let subscription = self.feed.subscribe(topic).await?;
        let id = subscription.id;
        info!(subscription = %id, topic = %topic, "Live channel attached");
        self.current = Some(subscription);
        Ok(id)
    }

    pub async fn detach(&mut self) {
        if let Some(subscription) = self.current.take() {
            self.feed.unsubscribe(subscription.id).await;
            info!(subscription = %subscription.id, topic = %subscription.topic, "Live channel released");
        }
    }

    /// Wait for the next item. Pends forever while detached; `None` means the
    /// channel was closed by the backend.
    pub async fn next_item(&mut self) -> Option<FeedItem> {
        match self.current.as_mut() {
            Some(subscription) => subscription.events.recv().await,
            None => std::future::pending().await,
        }
    }

    /// The next item if one is already queued. `Some(None)` means the
    /// channel was closed by the backend.
    pub fn try_next(&mut self) -> Option<Option<FeedItem>> {
        match self.current.as_mut()?.events.try_recv() {
            Ok(item) => Some(Some(item)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(None),
        }
    }
}

/// What a notification means for the window.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveAction {
    /// An insert in scope. It carries base columns only and must be
    /// hydrated before it can be appended.
    Hydrate(MessageId),
    /// A reply was posted under a top-level message.
    ReplyInserted { parent_id: MessageId, reply_id: MessageId },
    /// Replace in place.
    Update(Message),
    /// Remove, hard or soft. `parent_id` is set when the row was a reply.
    Remove {
        id: MessageId,
        parent_id: Option<MessageId>,
    },
    Ignore(&'static str),
}

pub struct LiveEventReconciler {
    connection: FeedConnection,
}

impl LiveEventReconciler {
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            connection: FeedConnection::new(feed),
        }
    }

    pub fn topic(&self) -> Option<FeedTopic> {
        self.connection.topic()
    }

    /// Follow `conversation_id`, releasing the previous conversation's
    /// channel first.
    pub async fn follow(&mut self, conversation_id: ConversationId) -> Result<SubscriptionId, BackendError> {
        self.connection
            .attach(FeedTopic::Conversation(conversation_id))
            .await
    }

    pub async fn stop(&mut self) {
        self.connection.detach().await;
    }

    pub async fn next_item(&mut self) -> Option<FeedItem> {
        self.connection.next_item().await
    }

    pub fn try_next(&mut self) -> Option<Option<FeedItem>> {
        self.connection.try_next()
    }

    /// Parse a raw payload and translate it for the window showing `scope`
    /// of `conversation_id`.
    pub fn translate(
        payload: &serde_json::Value,
        conversation_id: Option<ConversationId>,
        scope: MessageScope,
    ) -> Result<LiveAction, ProtocolError> {
        let event = ChangeEvent::from_payload(payload)?;
        trace!(kind = %event.kind(), id = %event.message_id(), "Notification received");
        Ok(Self::translate_event(event, conversation_id, scope))
    }

    pub fn translate_event(
        event: ChangeEvent,
        conversation_id: Option<ConversationId>,
        scope: MessageScope,
    ) -> LiveAction {
        if let (Some(active), Some(event_conversation)) = (conversation_id, event.conversation_id()) {
            if active != event_conversation {
                return LiveAction::Ignore("another conversation");
            }
        }

        match event {
            ChangeEvent::Insert { new } => {
                if new.is_deleted() {
                    return LiveAction::Ignore("inserted already deleted");
                }
                if scope.admits_parent(new.parent_id) {
                    return LiveAction::Hydrate(new.id);
                }
                match (scope, new.parent_id) {
                    (MessageScope::TopLevel, Some(parent_id)) => LiveAction::ReplyInserted {
                        parent_id,
                        reply_id: new.id,
                    },
                    _ => LiveAction::Ignore("outside the window's scope"),
                }
            }
            ChangeEvent::Update { new, .. } => {
                if new.is_deleted() {
                    debug!(id = %new.id, "Soft delete received as update");
                    LiveAction::Remove {
                        id: new.id,
                        parent_id: new.parent_id,
                    }
                } else {
                    LiveAction::Update(Message::from_row(new))
                }
            }
            ChangeEvent::Delete { old } => LiveAction::Remove {
                id: old.id,
                parent_id: old.parent_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use vigil_shared::protocol::{MessageRow, RowRef};
    use vigil_shared::types::{ContentKind, UserId};

    use super::*;
    use crate::testing::FakeFeed;

    fn row(conversation: ConversationId, parent_id: Option<MessageId>) -> MessageRow {
        MessageRow {
            id: MessageId::new(),
            conversation_id: conversation,
            sender_id: UserId::new(),
            kind: ContentKind::Text,
            content: "Amen".into(),
            parent_id,
            is_restricted: false,
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
        }
    }

    fn translate(event: ChangeEvent, c: ConversationId, scope: MessageScope) -> LiveAction {
        LiveEventReconciler::translate_event(event, Some(c), scope)
    }

    #[test]
    fn insert_in_scope_needs_hydration() {
        let c = ConversationId::new();
        let new = row(c, None);
        let id = new.id;
        assert_eq!(
            translate(ChangeEvent::Insert { new }, c, MessageScope::TopLevel),
            LiveAction::Hydrate(id)
        );
    }

    #[test]
    fn reply_insert_in_main_timeline_reports_parent() {
        let c = ConversationId::new();
        let parent = MessageId::new();
        let new = row(c, Some(parent));
        let reply_id = new.id;

        assert_eq!(
            translate(ChangeEvent::Insert { new: new.clone() }, c, MessageScope::TopLevel),
            LiveAction::ReplyInserted { parent_id: parent, reply_id }
        );
        assert_eq!(
            translate(ChangeEvent::Insert { new }, c, MessageScope::Replies(parent)),
            LiveAction::Hydrate(reply_id)
        );
    }

    #[test]
    fn reply_to_reply_is_ignored_in_thread() {
        let c = ConversationId::new();
        let parent = MessageId::new();
        let nested = row(c, Some(MessageId::new()));
        assert!(matches!(
            translate(ChangeEvent::Insert { new: nested }, c, MessageScope::Replies(parent)),
            LiveAction::Ignore(_)
        ));
    }

    #[test]
    fn foreign_conversation_is_ignored() {
        let new = row(ConversationId::new(), None);
        assert!(matches!(
            translate(ChangeEvent::Insert { new }, ConversationId::new(), MessageScope::TopLevel),
            LiveAction::Ignore(_)
        ));
    }

    #[test]
    fn soft_delete_update_becomes_remove() {
        let c = ConversationId::new();
        let parent = MessageId::new();
        let mut new = row(c, Some(parent));
        new.deleted_at = Some(Utc::now());
        let id = new.id;

        assert_eq!(
            translate(ChangeEvent::Update { new, old: None }, c, MessageScope::TopLevel),
            LiveAction::Remove { id, parent_id: Some(parent) }
        );
    }

    #[test]
    fn delete_keeps_opportunistic_parent() {
        let c = ConversationId::new();
        let id = MessageId::new();
        let parent = MessageId::new();
        let old = RowRef {
            id,
            parent_id: Some(parent),
            conversation_id: None,
        };

        assert_eq!(
            translate(ChangeEvent::Delete { old }, c, MessageScope::TopLevel),
            LiveAction::Remove { id, parent_id: Some(parent) }
        );
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let c = ConversationId::new();
        for payload in [
            json!({ "new": {} }),
            json!({ "eventType": "TRUNCATE" }),
            json!({ "eventType": "INSERT", "new": { "id": "not-a-uuid" } }),
        ] {
            assert!(LiveEventReconciler::translate(&payload, Some(c), MessageScope::TopLevel).is_err());
        }
    }

    #[tokio::test]
    async fn follow_releases_previous_channel_first() {
        let feed = Arc::new(FakeFeed::default());
        let mut live = LiveEventReconciler::new(feed.clone());
        let (a, b) = (ConversationId::new(), ConversationId::new());

        live.follow(a).await.unwrap();
        live.follow(b).await.unwrap();
        live.stop().await;

        assert_eq!(
            feed.log(),
            vec![
                format!("subscribe {}", FeedTopic::Conversation(a)),
                format!("unsubscribe {}", FeedTopic::Conversation(a)),
                format!("subscribe {}", FeedTopic::Conversation(b)),
                format!("unsubscribe {}", FeedTopic::Conversation(b)),
            ]
        );
        assert_eq!(feed.live_count(), 0);
    }
}
