//! CRUD operations for users, conversations and participants.

use chrono::{DateTime, Utc};
use rusqlite::params;

use vigil_shared::types::{ConversationId, TenantId, UserId};

use crate::database::{decode_enum, decode_opt_ts, decode_ts, decode_uuid, encode_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{Conversation, ConversationOverview, User};

impl Database {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Insert a user or refresh their profile fields.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, avatar_url, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                avatar_url   = excluded.avatar_url",
            params![
                user.id.to_string(),
                user.display_name,
                user.avatar_url,
                encode_ts(&user.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, display_name, avatar_url, created_at FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conn().execute(
            "INSERT INTO conversations (id, tenant_id, kind, name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation.id.to_string(),
                conversation.tenant_id.to_string(),
                conversation.kind.as_str(),
                conversation.name,
                encode_ts(&conversation.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                "SELECT id, tenant_id, kind, name, created_at
                 FROM conversations WHERE id = ?1",
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    // ------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------

    /// Add a user to a conversation. Adding an existing member is a no-op.
    pub fn add_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        joined_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO participants (conversation_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![conversation_id.to_string(), user_id.to_string(), encode_ts(&joined_at)],
        )?;
        Ok(())
    }

    pub fn is_participant(&self, conversation_id: ConversationId, user_id: UserId) -> Result<bool> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Members of a conversation, in join order.
    pub fn participants(&self, conversation_id: ConversationId) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(
            "SELECT u.id, u.display_name, u.avatar_url, u.created_at
             FROM participants p
             JOIN users u ON u.id = p.user_id
             WHERE p.conversation_id = ?1
             ORDER BY p.joined_at ASC, u.id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id.to_string()], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Move a participant's read marker forward. Markers never move back.
    pub fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE participants SET last_read_at = ?1
             WHERE conversation_id = ?2 AND user_id = ?3
               AND (last_read_at IS NULL OR last_read_at < ?1)",
            params![encode_ts(&at), conversation_id.to_string(), user_id.to_string()],
        )?;

        if affected == 0 && !self.is_participant(conversation_id, user_id)? {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn last_read_at(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT last_read_at FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        Ok(decode_opt_ts(0, raw)?)
    }

    /// Top-level, live messages from others newer than the user's read marker.
    pub fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> Result<u32> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*)
             FROM messages m
             JOIN participants p
               ON p.conversation_id = m.conversation_id AND p.user_id = ?2
             WHERE m.conversation_id = ?1
               AND m.deleted_at IS NULL
               AND m.parent_id IS NULL
               AND m.sender_id != ?2
               AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at)",
            params![conversation_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Every conversation `viewer` participates in within `tenant_id`.
    pub fn list_conversations(&self, viewer: UserId, tenant_id: TenantId) -> Result<Vec<ConversationOverview>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.tenant_id, c.kind, c.name, c.created_at
             FROM conversations c
             JOIN participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?1 AND c.tenant_id = ?2
             ORDER BY c.created_at DESC",
        )?;

        let rows = stmt.query_map(params![viewer.to_string(), tenant_id.to_string()], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }

        let mut overviews = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            overviews.push(ConversationOverview {
                participants: self.participants(conversation.id)?,
                last_message: self.last_message(conversation.id)?,
                unread_count: self.unread_count(conversation.id, viewer)?,
                last_read_at: self.last_read_at(conversation.id, viewer)?,
                conversation,
            });
        }
        Ok(overviews)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(3)?;

    Ok(User {
        id: UserId(decode_uuid(0, &id)?),
        display_name: row.get(1)?,
        avatar_url: row.get(2)?,
        created_at: decode_ts(3, &created_at)?,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let tenant_id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let created_at: String = row.get(4)?;

    Ok(Conversation {
        id: ConversationId(decode_uuid(0, &id)?),
        tenant_id: TenantId(decode_uuid(1, &tenant_id)?),
        kind: decode_enum(2, &kind)?,
        name: row.get(3)?,
        created_at: decode_ts(4, &created_at)?,
    })
}
