use chrono::{DateTime, Utc};
use uuid::Uuid;

use parlor_types::models::Room;

use crate::StoreError;

#[derive(Debug, Clone)]
pub struct RoomRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_temporary: bool,
    pub expires_at: Option<String>,
    pub last_activity: String,
    pub message_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_username: Option<String>,
    pub content: String,
    pub sentiment: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub username: Option<String>,
    pub emoji: String,
}

pub(crate) fn parse_uuid(field: &str, value: &str) -> Result<Uuid, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("{field}: {value}")))
}

pub(crate) fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("{field}: {value}")))
}

impl RoomRow {
    pub fn into_room(self) -> Result<Room, StoreError> {
        Ok(Room {
            id: parse_uuid("rooms.id", &self.id)?,
            name: self.name,
            description: self.description,
            is_temporary: self.is_temporary,
            expires_at: self
                .expires_at
                .as_deref()
                .map(|v| parse_timestamp("rooms.expires_at", v))
                .transpose()?,
            last_activity: parse_timestamp("rooms.last_activity", &self.last_activity)?,
            message_count: self.message_count,
            created_at: parse_timestamp("rooms.created_at", &self.created_at)?,
        })
    }
}
