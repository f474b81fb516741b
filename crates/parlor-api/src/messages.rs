use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use parlor_types::api::Claims;

use crate::{run_store, AppState};

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination: pass `next_cursor` from the previous page
    /// to fetch the messages older than it.
    pub before: Option<Uuid>,
}

fn default_limit() -> u32 {
    50
}

/// One ascending page of a room's history, reactions included.
pub async fn get_history(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let page = run_store(move || db.history(room_id, query.before, query.limit)).await?;
    Ok(Json(page))
}
