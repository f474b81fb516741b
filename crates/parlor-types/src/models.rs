use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Emoji the clients offer in their reaction picker. This is configuration,
/// not a protocol restriction: the toggle path accepts any non-empty key.
pub const DEFAULT_REACTION_EMOJI: &[&str] = &["👍", "❤️", "😂", "😢", "🙏"];

/// A named channel scoping a set of messages and joined connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub is_temporary: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
}

impl Room {
    /// Passive expiry: a temporary room past its deadline no longer exists
    /// as far as any caller is concerned.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Rooms with activity in the last two weeks count as active.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.last_activity > now - Duration::days(14)
    }

    /// Temporary rooms within three days of expiry, surfaced so clients can
    /// warn members before rotation removes the room.
    pub fn is_expiring_soon(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| at <= now + Duration::days(3))
    }
}

/// Canonical name for the direct-message room between two users. Sorting the
/// pair guarantees the same two users always resolve to the same room,
/// regardless of who initiates.
pub fn direct_room_name(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("dm:{lo}_{hi}")
}

/// Sentiment tag annotated onto a message by the external AI collaborator.
/// Never trusted from the client; any annotation failure degrades to Neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    #[default]
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
        }
    }

    /// Lenient parse for values coming back from storage or the AI service.
    pub fn parse(s: &str) -> Self {
        match s {
            "positive" => Self::Positive,
            "negative" => Self::Negative,
            _ => Self::Neutral,
        }
    }
}

/// A user identity resolved to display data for broadcast payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: Uuid,
    pub username: String,
}

/// Read-side projection of one reaction ledger entry: who reacted with a
/// given emoji. An entry with an empty user set is never observable; the
/// ledger removes it instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionView {
    pub emoji: String,
    pub count: usize,
    pub users: Vec<UserRef>,
}

impl ReactionView {
    pub fn reacted_by(&self, viewer: Uuid) -> bool {
        self.users.iter().any(|u| u.id == viewer)
    }
}

/// A message as delivered to clients, over both the history endpoint and the
/// gateway fan-out. Sender/room/content/timestamp are immutable once
/// persisted; only `reactions` changes, through the toggle protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender: UserRef,
    pub content: String,
    pub sentiment: Sentiment,
    pub created_at: DateTime<Utc>,
    pub reactions: Vec<ReactionView>,
    /// Echoed verbatim from the sender's `send` command so the sender can
    /// reconcile its own optimistic copy. Rides the broadcast to every
    /// member of the room; only the originator holds a matching token.
    /// Absent on history reads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<String>,
}
