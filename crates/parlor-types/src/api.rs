use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MessageView;

// -- JWT Claims --

/// JWT claims shared between the REST middleware and the gateway's
/// connection-time verification. Canonical definition lives here so the two
/// crates cannot drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- History --

/// One page of room history. `items` are in ascending order; `next_cursor`
/// is the id of the oldest item returned, to be passed back as `before`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryPage {
    pub items: Vec<MessageView>,
    pub next_cursor: Option<Uuid>,
    pub has_more: bool,
}
