//! Ports to the hosted backend.
//!
//! The synchronization core never talks to a backend SDK directly. It sees
//! three narrow async interfaces: a paged message query, a change-notification
//! feed and a conversation directory. [`local::LocalBackend`] implements all
//! three over the local SQLite store.

pub mod local;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use vigil_shared::protocol::FeedTopic;
use vigil_shared::types::{ConversationId, MessageId, MessageScope, TenantId, UserId};
use vigil_store::{ConversationOverview, Message};

use crate::error::BackendError;

pub use local::LocalBackend;

/// One Fetch Page call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub conversation_id: Option<ConversationId>,
    pub tenant_id: Option<TenantId>,
    pub scope: MessageScope,
    pub offset: u32,
    pub limit: u32,
}

impl PageRequest {
    /// Both identifiers, when present. A request missing either one has
    /// nothing to fetch.
    pub fn target(&self) -> Option<(ConversationId, TenantId)> {
        Some((self.conversation_id?, self.tenant_id?))
    }
}

/// Paged and point reads of hydrated messages.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Up to `limit` messages of the requested scope, newest first, each with
    /// sender details and a reply count. Missing identifiers yield an empty
    /// page.
    async fn fetch_page(&self, request: PageRequest) -> Result<Vec<Message>, BackendError>;

    /// The hydration read. `None` when the message is gone or not visible.
    async fn fetch_by_id(
        &self,
        id: MessageId,
        tenant_id: Option<TenantId>,
    ) -> Result<Option<Message>, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What a live subscription delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    /// A raw change notification payload, parsed by the receiver.
    Change(serde_json::Value),
    /// The channel reported an error. The subscription stays open.
    Error(String),
}

/// An open subscription. Dropping the receiver does not release the
/// backend-side channel; call [`ChangeFeed::unsubscribe`].
#[derive(Debug)]
pub struct FeedSubscription {
    pub id: SubscriptionId,
    pub topic: FeedTopic,
    pub events: mpsc::Receiver<FeedItem>,
}

/// The change-data-capture stream.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, topic: FeedTopic) -> Result<FeedSubscription, BackendError>;

    /// Release a subscription. Returns once the backend no longer delivers
    /// on it. Unknown identifiers are ignored.
    async fn unsubscribe(&self, id: SubscriptionId);
}

/// Conversation metadata for the conversation list.
#[async_trait]
pub trait ConversationSource: Send + Sync {
    async fn list_conversations(
        &self,
        viewer: UserId,
        tenant_id: TenantId,
    ) -> Result<Vec<ConversationOverview>, BackendError>;

    /// Persist the viewer's read marker.
    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
        at: DateTime<Utc>,
    ) -> Result<(), BackendError>;
}
