use rusqlite::Connection;
use tracing::info;

use crate::StoreError;

pub fn run(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        -- User directory: display data for broadcast payloads. Rows are
        -- upserted from verified claims at connection time; registration
        -- itself is owned by the auth collaborator.
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rooms (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL UNIQUE,
            description     TEXT NOT NULL,
            is_temporary    INTEGER NOT NULL DEFAULT 0,
            expires_at      TEXT,
            last_activity   TEXT NOT NULL,
            message_count   INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        -- Expiry index for the passive-cleanup sweep
        CREATE INDEX IF NOT EXISTS idx_rooms_expires
            ON rooms(expires_at) WHERE expires_at IS NOT NULL;

        -- seq is the commit order; (room_id, seq) supports descending
        -- cursor pagination per room.
        CREATE TABLE IF NOT EXISTS messages (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            id          TEXT NOT NULL UNIQUE,
            room_id     TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            sender_id   TEXT NOT NULL,
            content     TEXT NOT NULL,
            sentiment   TEXT NOT NULL DEFAULT 'neutral',
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room_seq
            ON messages(room_id, seq DESC);

        -- Reaction ledger. The primary key is the at-most-one-reaction-per
        -- (message, user, emoji) invariant; an emoji with no remaining rows
        -- simply has no entry, so empty user sets are unrepresentable.
        CREATE TABLE IF NOT EXISTS reactions (
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);
        ",
    )?;

    info!("database migrations complete");
    Ok(())
}
