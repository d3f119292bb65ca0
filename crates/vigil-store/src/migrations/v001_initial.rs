//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `users`, `conversations`, `participants`
//! and `messages`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID
    display_name TEXT,
    avatar_url   TEXT,
    created_at   TEXT NOT NULL                -- RFC-3339, microsecond precision
);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id         TEXT PRIMARY KEY NOT NULL,     -- UUID
    tenant_id  TEXT NOT NULL,                 -- church / organisation scope
    kind       TEXT NOT NULL,                 -- direct | small_group | ministry | church_wide
    name       TEXT,                          -- derived from participants when NULL
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_tenant ON conversations(tenant_id);

-- ----------------------------------------------------------------
-- Participants (membership + read marker)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS participants (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    joined_at       TEXT NOT NULL,
    last_read_at    TEXT,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    kind            TEXT NOT NULL,              -- text | image | prayer_card | system
    content         TEXT NOT NULL DEFAULT '',
    parent_id       TEXT,                       -- non-null only for thread replies
    is_restricted   INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    deleted_at      TEXT,                       -- soft delete marker

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
    ON messages(conversation_id, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(parent_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
