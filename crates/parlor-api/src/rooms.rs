use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use parlor_types::api::Claims;

use crate::{run_store, AppState};

/// Idempotently create and return the prebuilt rooms.
pub async fn ensure_prebuilt(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let rooms = run_store(move || db.ensure_prebuilt_rooms()).await?;
    Ok(Json(rooms))
}

/// Get or create the direct-message room between the current user and
/// `other_user_id`. Either side resolving the pair lands in the same room.
pub async fn resolve_direct(
    State(state): State<AppState>,
    Path(other_user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let me = claims.sub;
    let room = run_store(move || db.resolve_direct_room(me, other_user_id)).await?;
    Ok(Json(room))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let room = run_store(move || db.get_room(room_id)).await?;
    Ok(Json(room))
}
