//! Change notifications pushed by the backend's change-data-capture stream.
//!
//! Payloads arrive as loosely shaped JSON. They are parsed once, at the edge,
//! into [`ChangeEvent`] so that everything downstream matches on a typed
//! union instead of poking at an opaque value.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::MESSAGES_TABLE;
use crate::error::ProtocolError;
use crate::types::{ContentKind, ConversationId, MessageId, UserId};

/// The raw columns of a `messages` row, without any relational detail
/// (no sender profile, no reply-count aggregate).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub is_restricted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MessageRow {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// The last-known identity of a row, as carried by DELETE (and sometimes
/// UPDATE) notifications. Only `id` is guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowRef {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// One change notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "eventType", rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    /// A row was inserted. Carries base columns only.
    Insert { new: MessageRow },
    /// A row was updated. Carries the full row.
    Update {
        new: MessageRow,
        #[serde(
            default,
            deserialize_with = "lenient_row_ref",
            skip_serializing_if = "Option::is_none"
        )]
        old: Option<RowRef>,
    },
    /// A row was deleted.
    Delete { old: RowRef },
}

impl ChangeEvent {
    /// Parse a notification payload.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, ProtocolError> {
        let event_type = payload
            .get("eventType")
            .and_then(|v| v.as_str())
            .ok_or(ProtocolError::MissingField("eventType"))?;

        match event_type {
            "INSERT" | "UPDATE" | "DELETE" => {}
            other => return Err(ProtocolError::UnknownEventType(other.to_string())),
        }

        Ok(Self::deserialize(payload)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let payload: serde_json::Value = serde_json::from_slice(bytes)?;
        Self::from_payload(&payload)
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert { .. } => ChangeKind::Insert,
            Self::Update { .. } => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }

    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Insert { new } | Self::Update { new, .. } => new.id,
            Self::Delete { old } => old.id,
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::Insert { new } | Self::Update { new, .. } => Some(new.conversation_id),
            Self::Delete { old } => old.conversation_id,
        }
    }

    pub fn parent_id(&self) -> Option<MessageId> {
        match self {
            Self::Insert { new } | Self::Update { new, .. } => new.parent_id,
            Self::Delete { old } => old.parent_id,
        }
    }
}

/// UPDATE notifications often carry an `old` object with nothing but the
/// primary key, or nothing at all. Anything unusable becomes `None`.
fn lenient_row_ref<'de, D>(deserializer: D) -> Result<Option<RowRef>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

/// A change feed subscription target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedTopic {
    /// Inserts, updates and deletes of one conversation's messages.
    Conversation(ConversationId),
    /// Inserts across every conversation the caller can see.
    AllConversations,
}

impl FeedTopic {
    pub fn name(&self) -> String {
        match self {
            Self::Conversation(id) => format!("{MESSAGES_TABLE}:conversation_id=eq.{id}"),
            Self::AllConversations => format!("{MESSAGES_TABLE}:all"),
        }
    }

    /// Whether an event belongs on this topic.
    ///
    /// DELETE notifications without a conversation id are delivered to every
    /// conversation topic; receivers ignore identifiers they do not hold.
    pub fn admits(&self, event: &ChangeEvent) -> bool {
        match self {
            Self::Conversation(id) => match event.conversation_id() {
                Some(conversation_id) => conversation_id == *id,
                None => event.kind() == ChangeKind::Delete,
            },
            Self::AllConversations => event.kind() == ChangeKind::Insert,
        }
    }
}

impl fmt::Display for FeedTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
