//! The durable message log: append, point reads, cursor pagination.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use parlor_types::api::HistoryPage;
use parlor_types::models::{MessageView, ReactionView, Sentiment, UserRef};

use crate::models::{parse_timestamp, parse_uuid, MessageRow, ReactionRow};
use crate::rooms::query_room_by_id;
use crate::{Database, StoreError};

/// Hard cap on one history page.
pub const HISTORY_LIMIT_MAX: u32 = 100;

impl Database {
    /// Append a message to a room's log. One transaction inserts the row
    /// and bumps the owning room's `message_count`/`last_activity`; both
    /// happen exactly once per successful append, and never for reaction
    /// changes.
    pub fn append_message(
        &self,
        sender_id: Uuid,
        room_id: Uuid,
        content: &str,
        sentiment: Sentiment,
    ) -> Result<MessageView, StoreError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(StoreError::Validation(
                "Message content cannot be empty.".into(),
            ));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let now = Utc::now();
            let room = query_room_by_id(&tx, room_id)?
                .ok_or(StoreError::RoomNotFound)?
                .into_room()?;
            if room.is_expired(now) {
                return Err(StoreError::RoomNotFound);
            }

            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO messages (id, room_id, sender_id, content, sentiment, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    room_id.to_string(),
                    sender_id.to_string(),
                    content,
                    sentiment.as_str(),
                    now.to_rfc3339(),
                ],
            )?;
            tx.execute(
                "UPDATE rooms
                 SET message_count = message_count + 1, last_activity = ?2
                 WHERE id = ?1",
                params![room_id.to_string(), now.to_rfc3339()],
            )?;

            let sender_username: Option<String> = tx
                .query_row(
                    "SELECT username FROM users WHERE id = ?1",
                    [sender_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            tx.commit()?;

            Ok(MessageView {
                id,
                room_id,
                sender: UserRef {
                    id: sender_id,
                    username: sender_username.unwrap_or_else(|| "unknown".to_string()),
                },
                content: content.to_string(),
                sentiment,
                created_at: now,
                reactions: Vec::new(),
                correlation_token: None,
            })
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<MessageView, StoreError> {
        self.with_conn(|conn| load_message_view(conn, id))
    }

    /// One page of room history, ascending. Retrieval is newest-first over
    /// the (room, seq) index, reversed before returning; `next_cursor` is
    /// the oldest id on the page when older messages remain. An expired
    /// room reads as not found, same as `get_room`.
    pub fn history(
        &self,
        room_id: Uuid,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<HistoryPage, StoreError> {
        let limit = limit.clamp(1, HISTORY_LIMIT_MAX) as usize;

        self.with_conn(|conn| {
            let room = query_room_by_id(conn, room_id)?
                .ok_or(StoreError::RoomNotFound)?
                .into_room()?;
            if room.is_expired(Utc::now()) {
                return Err(StoreError::RoomNotFound);
            }

            // Exclusive cursor: resolve the id to its commit position.
            let before_seq: Option<i64> = match before {
                Some(id) => Some(
                    conn.query_row(
                        "SELECT seq FROM messages WHERE id = ?1",
                        [id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or(StoreError::MessageNotFound)?,
                ),
                None => None,
            };

            let mut stmt = conn.prepare(
                "SELECT m.id, m.room_id, m.sender_id, u.username, m.content,
                        m.sentiment, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.room_id = ?1 AND (?2 IS NULL OR m.seq < ?2)
                 ORDER BY m.seq DESC
                 LIMIT ?3",
            )?;
            let mut rows: Vec<MessageRow> = stmt
                .query_map(
                    params![room_id.to_string(), before_seq, (limit + 1) as i64],
                    map_message_row,
                )?
                .collect::<Result<_, _>>()?;

            let has_more = rows.len() > limit;
            rows.truncate(limit);
            rows.reverse(); // newest-first retrieval, ascending result

            let reactions = query_reactions_for_messages(
                conn,
                &rows.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            )?;

            let items = rows
                .into_iter()
                .map(|row| row_to_view(row, &reactions))
                .collect::<Result<Vec<_>, _>>()?;

            let next_cursor = if has_more {
                items.first().map(|m| m.id)
            } else {
                None
            };

            Ok(HistoryPage {
                items,
                next_cursor,
                has_more,
            })
        })
    }
}

pub(crate) fn load_message_view(conn: &Connection, id: Uuid) -> Result<MessageView, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.room_id, m.sender_id, u.username, m.content,
                m.sentiment, m.created_at
         FROM messages m
         LEFT JOIN users u ON m.sender_id = u.id
         WHERE m.id = ?1",
    )?;
    let row = stmt
        .query_row([id.to_string()], map_message_row)
        .optional()?
        .ok_or(StoreError::MessageNotFound)?;

    let reactions = query_reactions_for_messages(conn, std::slice::from_ref(&row.id))?;
    row_to_view(row, &reactions)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row.get(3)?,
        content: row.get(4)?,
        sentiment: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Batch-fetch ledger rows for a page of messages, reaction order preserved.
fn query_reactions_for_messages(
    conn: &Connection,
    message_ids: &[String],
) -> Result<Vec<ReactionRow>, StoreError> {
    if message_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT r.message_id, r.user_id, u.username, r.emoji
         FROM reactions r
         LEFT JOIN users u ON r.user_id = u.id
         WHERE r.message_id IN ({})
         ORDER BY r.message_id, r.created_at, r.rowid",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
        .iter()
        .map(|id| id as &dyn rusqlite::types::ToSql)
        .collect();

    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok(ReactionRow {
                message_id: row.get(0)?,
                user_id: row.get(1)?,
                username: row.get(2)?,
                emoji: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Pure read-side aggregation of ledger rows into per-emoji views. Entry
/// order follows the first reaction with each emoji; user order follows
/// reaction time. Never mutates the ledger.
fn group_reactions(message_id: &str, rows: &[ReactionRow]) -> Result<Vec<ReactionView>, StoreError> {
    let mut views: Vec<ReactionView> = Vec::new();
    for row in rows.iter().filter(|r| r.message_id == message_id) {
        let user = UserRef {
            id: parse_uuid("reactions.user_id", &row.user_id)?,
            username: row
                .username
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        };
        match views.iter_mut().find(|v| v.emoji == row.emoji) {
            Some(view) => {
                view.users.push(user);
                view.count += 1;
            }
            None => views.push(ReactionView {
                emoji: row.emoji.clone(),
                count: 1,
                users: vec![user],
            }),
        }
    }
    Ok(views)
}

fn row_to_view(row: MessageRow, reactions: &[ReactionRow]) -> Result<MessageView, StoreError> {
    let grouped = group_reactions(&row.id, reactions)?;
    Ok(MessageView {
        id: parse_uuid("messages.id", &row.id)?,
        room_id: parse_uuid("messages.room_id", &row.room_id)?,
        sender: UserRef {
            id: parse_uuid("messages.sender_id", &row.sender_id)?,
            username: row
                .sender_username
                .unwrap_or_else(|| "unknown".to_string()),
        },
        content: row.content,
        sentiment: Sentiment::parse(&row.sentiment),
        created_at: parse_timestamp("messages.created_at", &row.created_at)?,
        reactions: grouped,
        correlation_token: None,
    })
}
