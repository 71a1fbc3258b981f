//! v001 -- Initial schema creation.
//!
//! Creates `conversations` (with the embedded participant pair and the
//! last-message summary) and the append-only `messages` ledger.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    kind            TEXT NOT NULL,              -- staff_guard | staff_applicant

    -- Participant pair, ordered so that user_a_id < user_b_id
    user_a_id       TEXT NOT NULL,
    user_a_role     TEXT NOT NULL,
    user_a_name     TEXT NOT NULL,
    user_b_id       TEXT NOT NULL,
    user_b_role     TEXT NOT NULL,
    user_b_name     TEXT NOT NULL,

    -- Denormalized summary of the latest message (all NULL until the first)
    last_message_id TEXT,
    last_sender_id  TEXT,
    last_text       TEXT,
    last_file_name  TEXT,
    last_seen       INTEGER NOT NULL DEFAULT 0,
    last_message_at TEXT,

    created_at      TEXT NOT NULL,             -- RFC-3339, microseconds, UTC

    CHECK (user_a_id < user_b_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_pair
    ON conversations(kind, user_a_id, user_b_id);
CREATE INDEX IF NOT EXISTS idx_conversations_user_a ON conversations(user_a_id);
CREATE INDEX IF NOT EXISTS idx_conversations_user_b ON conversations(user_b_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq               INTEGER PRIMARY KEY AUTOINCREMENT,
    id                TEXT NOT NULL UNIQUE,        -- UUID v4
    conversation_id   TEXT NOT NULL,               -- FK -> conversations(id)
    sender_id         TEXT NOT NULL,
    sender_role       TEXT NOT NULL,
    text              TEXT NOT NULL DEFAULT '',
    file_path         TEXT,
    file_name         TEXT,
    seen_by_recipient INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    created_at        TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id),
    CHECK (length(trim(text)) > 0 OR file_path IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at, seq);

-- Seen state only ever moves forward.
CREATE TRIGGER IF NOT EXISTS trg_messages_seen_monotonic
BEFORE UPDATE OF seen_by_recipient ON messages
WHEN OLD.seen_by_recipient = 1 AND NEW.seen_by_recipient = 0
BEGIN
    SELECT RAISE(ABORT, 'seen_by_recipient cannot be cleared');
END;
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
