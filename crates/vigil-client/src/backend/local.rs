//! A backend served from the local SQLite store.
//!
//! Reads go straight to [`Database`]. Writes go through the helpers on
//! [`LocalBackend`], which publish the same change notifications the hosted
//! backend would: INSERT carries base columns only, UPDATE carries the full
//! row, DELETE carries the row's last-known identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vigil_shared::constants::CHANNEL_CAPACITY;
use vigil_shared::protocol::{ChangeEvent, FeedTopic, MessageRow, RowRef};
use vigil_shared::types::{ContentKind, ConversationId, MessageId, TenantId, UserId};
use vigil_store::{ConversationOverview, Database, Message, StoreError};

use super::{
    ChangeFeed, ConversationSource, FeedItem, FeedSubscription, MessageSource, PageRequest,
    SubscriptionId,
};
use crate::error::BackendError;

/// A message about to be sent.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: ContentKind,
    pub content: String,
    pub parent_id: Option<MessageId>,
    pub is_restricted: bool,
}

impl OutgoingMessage {
    pub fn text(conversation_id: ConversationId, sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id,
            kind: ContentKind::Text,
            content: content.into(),
            parent_id: None,
            is_restricted: false,
        }
    }

    pub fn reply_to(mut self, parent_id: MessageId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    fn into_row(self, at: DateTime<Utc>) -> MessageRow {
        MessageRow {
            id: MessageId::new(),
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            kind: self.kind,
            content: self.content,
            parent_id: self.parent_id,
            is_restricted: self.is_restricted,
            created_at: at,
            updated_at: Some(at),
            deleted_at: None,
        }
    }
}

struct Subscriber {
    topic: FeedTopic,
    tx: mpsc::Sender<FeedItem>,
}

/// All three backend ports over one local database.
pub struct LocalBackend {
    db: Arc<Mutex<Database>>,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl LocalBackend {
    pub fn new(db: Database) -> Self {
        Self::with_capacity(db, CHANNEL_CAPACITY)
    }

    /// `capacity` bounds each subscription's queue. Notifications for a full
    /// queue are dropped with a warning.
    pub fn with_capacity(db: Database, capacity: usize) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Run `f` against the database.
    pub fn with_db<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&Database) -> vigil_store::Result<T>,
    {
        let guard = self
            .db
            .lock()
            .map_err(|e| BackendError::Backend(format!("Lock poisoned: {e}")))?;
        f(&guard).map_err(BackendError::from)
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Persist a new message stamped with the current time and publish its
    /// INSERT. Returns the hydrated message, as the send path hands it back
    /// to the sender's own view.
    pub fn send_message(&self, outgoing: OutgoingMessage) -> Result<Message, BackendError> {
        let row = outgoing.into_row(Utc::now());
        self.insert_row(&row)?;

        let hydrated = self.with_db(|db| {
            let tenant_id = db.get_conversation(row.conversation_id)?.tenant_id;
            db.fetch_hydrated(row.id, tenant_id)
        })?;
        Ok(hydrated.unwrap_or_else(|| Message::from_row(row)))
    }

    /// Persist a prepared row and publish its INSERT.
    pub fn insert_row(&self, row: &MessageRow) -> Result<(), BackendError> {
        self.with_db(|db| db.insert_message(row)).map_err(rejected)?;
        debug!(id = %row.id, conversation = %row.conversation_id, "Message inserted");

        self.publish(&ChangeEvent::Insert { new: row.clone() });
        Ok(())
    }

    /// Replace a message's content and publish the UPDATE.
    pub fn edit_message(&self, id: MessageId, content: &str) -> Result<MessageRow, BackendError> {
        let row = self
            .with_db(|db| db.update_message_content(id, content, Utc::now()))
            .map_err(rejected)?;

        self.publish(&ChangeEvent::Update {
            new: row.clone(),
            old: Some(RowRef {
                id,
                parent_id: None,
                conversation_id: None,
            }),
        });
        Ok(row)
    }

    /// Soft-delete a message. Published as an UPDATE carrying `deleted_at`.
    pub fn soft_delete_message(&self, id: MessageId) -> Result<MessageRow, BackendError> {
        let row = self
            .with_db(|db| db.soft_delete_message(id, Utc::now()))
            .map_err(rejected)?;

        self.publish(&ChangeEvent::Update {
            new: row.clone(),
            old: None,
        });
        Ok(row)
    }

    /// Remove a message and publish the DELETE. Returns `None` if there was
    /// nothing to delete.
    pub fn delete_message(&self, id: MessageId) -> Result<Option<RowRef>, BackendError> {
        let Some(old) = self.with_db(|db| db.delete_message(id))? else {
            return Ok(None);
        };

        self.publish(&ChangeEvent::Delete { old: old.clone() });
        Ok(Some(old))
    }

    /// Report a channel error on every subscription to `topic`.
    pub fn report_channel_error(&self, topic: FeedTopic, reason: &str) {
        let Ok(subscribers) = self.subscribers.lock() else {
            return;
        };
        for subscriber in subscribers.values().filter(|s| s.topic == topic) {
            let _ = subscriber.tx.try_send(FeedItem::Error(reason.to_string()));
        }
    }

    fn publish(&self, event: &ChangeEvent) {
        let payload = event.to_payload();
        let Ok(subscribers) = self.subscribers.lock() else {
            warn!("Subscriber registry poisoned, notification dropped");
            return;
        };

        for (id, subscriber) in subscribers.iter() {
            if !subscriber.topic.admits(event) {
                continue;
            }
            match subscriber.tx.try_send(FeedItem::Change(payload.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscription = %id, kind = %event.kind(), "Subscriber lagging, notification dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscription = %id, "Subscriber receiver dropped");
                }
            }
        }
    }
}

/// Invariant violations on the write path are the caller's fault.
fn rejected(e: BackendError) -> BackendError {
    match e {
        BackendError::Store(StoreError::Constraint(reason)) => BackendError::Rejected(reason),
        BackendError::Store(StoreError::NotFound) => {
            BackendError::Rejected("message does not exist or was deleted".into())
        }
        other => other,
    }
}

#[async_trait]
impl MessageSource for LocalBackend {
    async fn fetch_page(&self, request: PageRequest) -> Result<Vec<Message>, BackendError> {
        let Some((conversation_id, tenant_id)) = request.target() else {
            return Ok(Vec::new());
        };
        self.with_db(|db| {
            db.fetch_page(
                conversation_id,
                tenant_id,
                request.scope,
                request.offset,
                request.limit,
            )
        })
    }

    async fn fetch_by_id(
        &self,
        id: MessageId,
        tenant_id: Option<TenantId>,
    ) -> Result<Option<Message>, BackendError> {
        let Some(tenant_id) = tenant_id else {
            return Ok(None);
        };
        self.with_db(|db| db.fetch_hydrated(id, tenant_id))
    }
}

#[async_trait]
impl ChangeFeed for LocalBackend {
    async fn subscribe(&self, topic: FeedTopic) -> Result<FeedSubscription, BackendError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, events) = mpsc::channel(self.capacity);

        self.subscribers
            .lock()
            .map_err(|e| BackendError::Subscription(format!("Lock poisoned: {e}")))?
            .insert(id, Subscriber { topic, tx });

        info!(subscription = %id, topic = %topic, "Subscribed");
        Ok(FeedSubscription { id, topic, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        let removed = self
            .subscribers
            .lock()
            .map(|mut s| s.remove(&id).is_some())
            .unwrap_or(false);

        if removed {
            info!(subscription = %id, "Unsubscribed");
        }
    }
}

#[async_trait]
impl ConversationSource for LocalBackend {
    async fn list_conversations(
        &self,
        viewer: UserId,
        tenant_id: TenantId,
    ) -> Result<Vec<ConversationOverview>, BackendError> {
        self.with_db(|db| db.list_conversations(viewer, tenant_id))
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
        at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        self.with_db(|db| db.mark_read(conversation_id, viewer, at))
    }
}
