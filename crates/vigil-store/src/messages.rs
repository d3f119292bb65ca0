//! Message reads and writes.
//!
//! Reads mirror the hosted backend: pages come back newest-first, exclude
//! soft-deleted rows, are restricted to one [`MessageScope`] and are joined
//! with sender details plus a live reply count.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use vigil_shared::protocol::{MessageRow, RowRef};
use vigil_shared::types::{ConversationId, MessageId, MessageScope, TenantId, UserId};

use crate::database::{decode_enum, decode_opt_ts, decode_ts, decode_uuid, encode_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{Message, SenderSummary};

const ROW_COLUMNS: &str = "m.id, m.conversation_id, m.sender_id, m.kind, m.content, m.parent_id,
     m.is_restricted, m.created_at, m.updated_at, m.deleted_at";

const HYDRATED_FROM: &str = "u.id, u.display_name, u.avatar_url,
     (SELECT COUNT(*) FROM messages r WHERE r.parent_id = m.id AND r.deleted_at IS NULL)
     FROM messages m
     JOIN conversations c ON c.id = m.conversation_id
     LEFT JOIN users u ON u.id = m.sender_id";

impl Database {
    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// One page of a conversation, newest first.
    ///
    /// Returns an empty page when the conversation does not belong to
    /// `tenant_id`.
    pub fn fetch_page(
        &self,
        conversation_id: ConversationId,
        tenant_id: TenantId,
        scope: MessageScope,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {ROW_COLUMNS}, {HYDRATED_FROM}
             WHERE m.conversation_id = ?1
               AND c.tenant_id = ?2
               AND m.deleted_at IS NULL
               AND ((?3 IS NULL AND m.parent_id IS NULL) OR m.parent_id = ?3)
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT ?4 OFFSET ?5"
        );
        let mut stmt = self.conn().prepare(&sql)?;

        let rows = stmt.query_map(
            params![
                conversation_id.to_string(),
                tenant_id.to_string(),
                scope.parent().map(|p| p.to_string()),
                limit,
                offset,
            ],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// A single hydrated message, or `None` when it is missing, soft-deleted
    /// or outside `tenant_id`.
    pub fn fetch_hydrated(&self, id: MessageId, tenant_id: TenantId) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {ROW_COLUMNS}, {HYDRATED_FROM}
             WHERE m.id = ?1 AND c.tenant_id = ?2 AND m.deleted_at IS NULL"
        );

        let message = self
            .conn()
            .query_row(&sql, params![id.to_string(), tenant_id.to_string()], row_to_message)
            .optional()?;
        Ok(message)
    }

    /// The raw columns of a message, deleted or not.
    pub fn get_message_row(&self, id: MessageId) -> Result<MessageRow> {
        let sql = format!("SELECT {ROW_COLUMNS} FROM messages m WHERE m.id = ?1");
        self.conn()
            .query_row(&sql, params![id.to_string()], row_to_message_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Newest top-level, non-deleted message of a conversation.
    pub fn last_message(&self, conversation_id: ConversationId) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {ROW_COLUMNS}, {HYDRATED_FROM}
             WHERE m.conversation_id = ?1 AND m.deleted_at IS NULL AND m.parent_id IS NULL
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT 1"
        );

        let message = self
            .conn()
            .query_row(&sql, params![conversation_id.to_string()], row_to_message)
            .optional()?;
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert a new message.
    ///
    /// A reply must point at a live top-level message of the same
    /// conversation; replies to replies are refused.
    pub fn insert_message(&self, row: &MessageRow) -> Result<()> {
        if let Some(parent_id) = row.parent_id {
            let parent = self.get_message_row(parent_id).map_err(|e| match e {
                StoreError::NotFound => StoreError::Constraint(format!("parent {parent_id} does not exist")),
                other => other,
            })?;

            if parent.parent_id.is_some() {
                return Err(StoreError::Constraint(format!(
                    "parent {parent_id} is itself a reply"
                )));
            }
            if parent.conversation_id != row.conversation_id {
                return Err(StoreError::Constraint(format!(
                    "parent {parent_id} belongs to another conversation"
                )));
            }
            if parent.is_deleted() {
                return Err(StoreError::Constraint(format!("parent {parent_id} was deleted")));
            }
        }

        self.conn().execute(
            "INSERT INTO messages (id, conversation_id, sender_id, kind, content, parent_id,
                                   is_restricted, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.id.to_string(),
                row.conversation_id.to_string(),
                row.sender_id.to_string(),
                row.kind.as_str(),
                row.content,
                row.parent_id.map(|p| p.to_string()),
                row.is_restricted,
                encode_ts(&row.created_at),
                encode_ts(&row.updated_at.unwrap_or(row.created_at)),
                row.deleted_at.as_ref().map(encode_ts),
            ],
        )?;
        Ok(())
    }

    /// Replace the content of a live message and return the updated row.
    pub fn update_message_content(
        &self,
        id: MessageId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<MessageRow> {
        let affected = self.conn().execute(
            "UPDATE messages SET content = ?1, updated_at = ?2
             WHERE id = ?3 AND deleted_at IS NULL",
            params![content, encode_ts(&at), id.to_string()],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_message_row(id)
    }

    /// Mark a message deleted and return the updated row.
    pub fn soft_delete_message(&self, id: MessageId, at: DateTime<Utc>) -> Result<MessageRow> {
        let affected = self.conn().execute(
            "UPDATE messages SET deleted_at = ?1, updated_at = ?1
             WHERE id = ?2 AND deleted_at IS NULL",
            params![encode_ts(&at), id.to_string()],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_message_row(id)
    }

    /// Physically remove a message. Returns the row's last-known identity, or
    /// `None` if it did not exist.
    pub fn delete_message(&self, id: MessageId) -> Result<Option<RowRef>> {
        let row = match self.get_message_row(id) {
            Ok(row) => row,
            Err(StoreError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        self.conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id.to_string()])?;

        Ok(Some(RowRef {
            id,
            parent_id: row.parent_id,
            conversation_id: Some(row.conversation_id),
        }))
    }
}

fn row_to_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let parent_id: Option<String> = row.get(5)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(MessageRow {
        id: MessageId(decode_uuid(0, &id)?),
        conversation_id: ConversationId(decode_uuid(1, &conversation_id)?),
        sender_id: UserId(decode_uuid(2, &sender_id)?),
        kind: decode_enum(3, &kind)?,
        content: row.get(4)?,
        parent_id: parent_id
            .map(|p| decode_uuid(5, &p).map(MessageId))
            .transpose()?,
        is_restricted: row.get(6)?,
        created_at: decode_ts(7, &created_at)?,
        updated_at: Some(decode_ts(8, &updated_at)?),
        deleted_at: decode_opt_ts(9, row.get(9)?)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let base = row_to_message_row(row)?;

    let sender_known: Option<String> = row.get(10)?;
    let display_name: Option<String> = row.get(11)?;
    let avatar_url: Option<String> = row.get(12)?;
    let reply_count: u32 = row.get(13)?;

    let sender = SenderSummary {
        id: base.sender_id,
        display_name: sender_known.and(display_name),
        avatar_url,
    };

    let mut message = Message::from_row(base);
    message.reply_count = reply_count;
    message.sender = Some(sender);
    Ok(message)
}
