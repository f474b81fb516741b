//! Room registry (durable half) and the user directory.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use parlor_types::models::{direct_room_name, Room};

use crate::models::RoomRow;
use crate::{Database, StoreError};

/// Rooms created on first reference. Names and descriptions are the fixed
/// prebuilt set; everything else goes through explicit creation or rotation.
pub const PREBUILT_ROOMS: &[(&str, &str)] = &[
    ("general-chat", "General Chat"),
    ("sports", "Sports Talk"),
    ("technology", "Tech Discussion"),
    ("random", "Random Chat"),
];

impl Database {
    // -- User directory --

    /// Record display data for a user, from claims verified at connection
    /// time. Idempotent; a later connection with a changed username wins.
    pub fn upsert_user(&self, id: Uuid, username: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username,
                                               updated_at = excluded.updated_at",
                params![id.to_string(), username, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Directory lookup. A miss is `None`, never an error; callers decide
    /// on the placeholder.
    pub fn display_name(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT username FROM users WHERE id = ?1",
                    [id.to_string()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    // -- Room registry --

    /// Idempotently create the prebuilt rooms and return them. Safe under
    /// concurrent first-time calls: the UNIQUE constraint on `name` picks a
    /// single winner and everyone re-reads the surviving record.
    pub fn ensure_prebuilt_rooms(&self) -> Result<Vec<Room>, StoreError> {
        self.with_conn(|conn| {
            PREBUILT_ROOMS
                .iter()
                .map(|(name, description)| ensure_room(conn, name, description, false, None))
                .collect()
        })
    }

    /// Resolve the direct-message room between two users, creating it on
    /// first use. The canonical sorted-pair name guarantees both users land
    /// in the same room regardless of who initiates.
    pub fn resolve_direct_room(&self, a: Uuid, b: Uuid) -> Result<Room, StoreError> {
        let name = direct_room_name(a, b);
        self.with_conn(|conn| ensure_room(conn, &name, "Direct chat", false, None))
    }

    /// Fetch a room by id. A room whose expiry has passed is reported as
    /// not found; the sweep deletes the row later.
    pub fn get_room(&self, id: Uuid) -> Result<Room, StoreError> {
        self.with_conn(|conn| {
            let room = query_room_by_id(conn, id)?
                .ok_or(StoreError::RoomNotFound)?
                .into_room()?;
            if room.is_expired(Utc::now()) {
                return Err(StoreError::RoomNotFound);
            }
            Ok(room)
        })
    }

    /// Rotation support: create a temporary room with a future expiry.
    pub fn create_temporary_room(
        &self,
        name: &str,
        description: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Room, StoreError> {
        self.with_conn(|conn| ensure_room(conn, name, description, true, Some(expires_at)))
    }

    /// Rotation support: remove a room and (via cascade) its messages.
    pub fn delete_room(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM rooms WHERE id = ?1", [id.to_string()])?;
            if deleted == 0 {
                return Err(StoreError::RoomNotFound);
            }
            Ok(())
        })
    }

    /// Rotation support: the room with the fewest messages, oldest activity
    /// breaking ties.
    pub fn least_active_room(&self) -> Result<Option<Room>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, is_temporary, expires_at,
                        last_activity, message_count, created_at
                 FROM rooms
                 ORDER BY message_count ASC, last_activity ASC
                 LIMIT 1",
            )?;
            stmt.query_row([], map_room_row)
                .optional()?
                .map(RoomRow::into_room)
                .transpose()
        })
    }

    /// Passive expiry: delete rooms whose deadline has passed. Returns the
    /// number removed.
    pub fn purge_expired_rooms(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM rooms WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                [now.to_rfc3339()],
            )?)
        })
    }
}

fn ensure_room(
    conn: &Connection,
    name: &str,
    description: &str,
    is_temporary: bool,
    expires_at: Option<DateTime<Utc>>,
) -> Result<Room, StoreError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO rooms (id, name, description, is_temporary, expires_at,
                            last_activity, message_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?6)
         ON CONFLICT(name) DO NOTHING",
        params![
            Uuid::new_v4().to_string(),
            name,
            description,
            is_temporary,
            expires_at.map(|at| at.to_rfc3339()),
            now,
        ],
    )?;

    query_room_by_name(conn, name)?
        .ok_or(StoreError::RoomNotFound)?
        .into_room()
}

pub(crate) fn query_room_by_id(conn: &Connection, id: Uuid) -> Result<Option<RoomRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, is_temporary, expires_at,
                last_activity, message_count, created_at
         FROM rooms WHERE id = ?1",
    )?;
    Ok(stmt.query_row([id.to_string()], map_room_row).optional()?)
}

fn query_room_by_name(conn: &Connection, name: &str) -> Result<Option<RoomRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, is_temporary, expires_at,
                last_activity, message_count, created_at
         FROM rooms WHERE name = ?1",
    )?;
    Ok(stmt.query_row([name], map_room_row).optional()?)
}

fn map_room_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        is_temporary: row.get(3)?,
        expires_at: row.get(4)?,
        last_activity: row.get(5)?,
        message_count: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[test]
    fn ensure_prebuilt_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let first = db.ensure_prebuilt_rooms().unwrap();
        let second = db.ensure_prebuilt_rooms().unwrap();
        assert_eq!(first.len(), PREBUILT_ROOMS.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.name, b.name);
        }
    }

    #[test]
    fn concurrent_first_resolution_yields_one_room() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || db.ensure_prebuilt_rooms().unwrap())
            })
            .collect();

        let mut ids: Vec<Uuid> = handles
            .into_iter()
            .map(|h| h.join().unwrap()[0].id)
            .collect();
        ids.dedup();
        assert_eq!(ids.len(), 1, "every caller must observe the same record");
    }

    #[test]
    fn direct_room_is_symmetric() {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ab = db.resolve_direct_room(a, b).unwrap();
        let ba = db.resolve_direct_room(b, a).unwrap();
        assert_eq!(ab.id, ba.id);
        assert!(ab.name.starts_with("dm:"));
    }

    #[test]
    fn unknown_room_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_room(Uuid::new_v4()),
            Err(StoreError::RoomNotFound)
        ));
    }

    #[test]
    fn expired_room_is_invisible_and_purgeable() {
        let db = Database::open_in_memory().unwrap();
        let room = db
            .create_temporary_room("fleeting", "gone soon", Utc::now() - Duration::hours(1))
            .unwrap();

        assert!(matches!(
            db.get_room(room.id),
            Err(StoreError::RoomNotFound)
        ));
        assert_eq!(db.purge_expired_rooms(Utc::now()).unwrap(), 1);
        assert_eq!(db.purge_expired_rooms(Utc::now()).unwrap(), 0);
    }

    #[test]
    fn least_active_prefers_fewest_messages() {
        let db = Database::open_in_memory().unwrap();
        let rooms = db.ensure_prebuilt_rooms().unwrap();
        let sender = Uuid::new_v4();
        db.append_message(sender, rooms[0].id, "hi", Default::default())
            .unwrap();

        let least = db.least_active_room().unwrap().unwrap();
        assert_ne!(least.id, rooms[0].id);
        assert_eq!(least.message_count, 0);
    }

    #[test]
    fn delete_room_cascades_to_messages() {
        let db = Database::open_in_memory().unwrap();
        let room = db.ensure_prebuilt_rooms().unwrap().remove(0);
        let msg = db
            .append_message(Uuid::new_v4(), room.id, "doomed", Default::default())
            .unwrap();

        db.delete_room(room.id).unwrap();
        assert!(matches!(
            db.get_room(room.id),
            Err(StoreError::RoomNotFound)
        ));
        assert!(matches!(
            db.get_message(msg.id),
            Err(StoreError::MessageNotFound)
        ));
        assert!(matches!(
            db.delete_room(room.id),
            Err(StoreError::RoomNotFound)
        ));
    }

    #[test]
    fn directory_miss_is_none_not_error() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.display_name(Uuid::new_v4()).unwrap(), None);

        let id = Uuid::new_v4();
        db.upsert_user(id, "ada").unwrap();
        assert_eq!(db.display_name(id).unwrap().as_deref(), Some("ada"));

        db.upsert_user(id, "ada2").unwrap();
        assert_eq!(db.display_name(id).unwrap().as_deref(), Some("ada2"));
    }
}
