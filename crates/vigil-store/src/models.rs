//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vigil_shared::protocol::MessageRow;
use vigil_shared::types::{ContentKind, ConversationId, ConversationKind, MessageId, TenantId, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A member of the community.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    /// Optional human-readable display name.
    pub display_name: Option<String>,
    /// Optional URL of the avatar image in storage.
    pub avatar_url: Option<String>,
    /// When this user row was created.
    pub created_at: DateTime<Utc>,
}

/// Sender details joined onto a message for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderSummary {
    pub id: UserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A chat message, optionally hydrated with sender details and a reply count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: ContentKind,
    pub content: String,
    /// Non-null only for thread replies.
    pub parent_id: Option<MessageId>,
    pub is_restricted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-deletion marker. Deleted messages are never displayed.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Number of live replies. Always zero for replies themselves.
    pub reply_count: u32,
    /// `None` until the message has been hydrated.
    pub sender: Option<SenderSummary>,
}

impl Message {
    /// Build an unhydrated message from raw row columns.
    pub fn from_row(row: MessageRow) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            kind: row.kind,
            content: row.content,
            parent_id: row.parent_id,
            is_restricted: row.is_restricted,
            updated_at: row.updated_at.unwrap_or(row.created_at),
            created_at: row.created_at,
            deleted_at: row.deleted_at,
            reply_count: 0,
            sender: None,
        }
    }

    /// The raw columns of this message, as a change notification carries them.
    pub fn to_row(&self) -> MessageRow {
        MessageRow {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            kind: self.kind,
            content: self.content.clone(),
            parent_id: self.parent_id,
            is_restricted: self.is_restricted,
            created_at: self.created_at,
            updated_at: Some(self.updated_at),
            deleted_at: self.deleted_at,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_hydrated(&self) -> bool {
        self.sender.is_some()
    }

    /// Display ordering: creation time, ties broken by identifier.
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }

    /// Overwrite the row columns with those of `incoming`, keeping hydrated
    /// details the incoming copy does not carry.
    pub fn merge_update(&mut self, incoming: Message) {
        let reply_count = if incoming.is_hydrated() {
            incoming.reply_count
        } else {
            self.reply_count
        };
        let sender = incoming.sender.or_else(|| self.sender.take());

        *self = Message {
            sender,
            reply_count,
            ..incoming
        };
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A container of messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub tenant_id: TenantId,
    pub kind: ConversationKind,
    /// Explicit name. When `None` the name is derived from the participants.
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// The name shown to `viewer`.
    pub fn display_name(&self, participants: &[User], viewer: UserId) -> String {
        if let Some(name) = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return name.to_string();
        }

        let others: Vec<&str> = participants
            .iter()
            .filter(|u| u.id != viewer)
            .filter_map(|u| u.display_name.as_deref())
            .collect();

        if !others.is_empty() {
            return others.join(", ");
        }

        match self.kind {
            ConversationKind::Direct => "Direct message",
            ConversationKind::SmallGroup => "Small group",
            ConversationKind::Ministry => "Ministry",
            ConversationKind::ChurchWide => "Church",
        }
        .to_string()
    }
}

/// Membership of a user in a conversation, with their read marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
}

/// Everything the conversation list needs about one conversation, from the
/// point of view of one participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationOverview {
    pub conversation: Conversation,
    pub participants: Vec<User>,
    /// Newest top-level, non-deleted message.
    pub last_message: Option<Message>,
    pub unread_count: u32,
    pub last_read_at: Option<DateTime<Utc>>,
}
