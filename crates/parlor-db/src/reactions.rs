//! The reaction ledger and its toggle protocol.
//!
//! Per (message, emoji, user) the only states are absent and present, and
//! the only transition is `toggle`. Both directions run in one transaction
//! against the ledger's primary key, so concurrent toggles on the same
//! message serialize through a single authoritative mutation path and
//! lost-update races cannot occur.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use parlor_types::models::MessageView;

use crate::messages::load_message_view;
use crate::models::parse_uuid;
use crate::rooms::query_room_by_id;
use crate::{Database, StoreError};

/// Emoji keys are opaque strings, but an empty or absurdly long key is a
/// malformed request, not a reaction.
const EMOJI_MAX_BYTES: usize = 64;

impl Database {
    /// Flip `user_id`'s reaction with `emoji` on a message and return the
    /// fully updated message, user identities resolved to display data.
    /// Removing the last user of an emoji removes the entry itself; no
    /// zero-count entries persist.
    pub fn toggle_reaction(
        &self,
        message_id: Uuid,
        emoji: &str,
        user_id: Uuid,
    ) -> Result<MessageView, StoreError> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.len() > EMOJI_MAX_BYTES {
            return Err(StoreError::Validation("Malformed emoji.".into()));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            // Resolve through to the owning room: a message in an expired
            // room is as gone as the room itself.
            let owning_room: Option<String> = tx
                .query_row(
                    "SELECT room_id FROM messages WHERE id = ?1",
                    [message_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let owning_room = owning_room.ok_or(StoreError::MessageNotFound)?;
            let room = query_room_by_id(&tx, parse_uuid("messages.room_id", &owning_room)?)?
                .ok_or(StoreError::MessageNotFound)?
                .into_room()?;
            if room.is_expired(Utc::now()) {
                return Err(StoreError::MessageNotFound);
            }

            let removed = tx.execute(
                "DELETE FROM reactions
                 WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![message_id.to_string(), user_id.to_string(), emoji],
            )?;
            if removed == 0 {
                // The primary key makes a duplicate insert impossible even
                // if a racing toggle got here first.
                tx.execute(
                    "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        message_id.to_string(),
                        user_id.to_string(),
                        emoji,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
            }

            let view = load_message_view(&tx, message_id)?;
            tx.commit()?;
            Ok(view)
        })
    }
}
