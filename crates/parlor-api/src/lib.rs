pub mod messages;
pub mod middleware;
pub mod rooms;

use std::sync::Arc;

use axum::http::StatusCode;
use tracing::error;

use parlor_db::{Database, StoreError};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
}

/// Map store errors onto the query surface. Client-correctable errors keep
/// their meaning; storage trouble is logged and reported generically.
pub(crate) fn status_for(err: StoreError) -> StatusCode {
    match err {
        StoreError::RoomNotFound | StoreError::MessageNotFound => StatusCode::NOT_FOUND,
        StoreError::Validation(_) => StatusCode::BAD_REQUEST,
        other => {
            error!("store error: {other}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Run a blocking store call off the async runtime.
pub(crate) async fn run_store<T, F>(f: F) -> Result<T, StatusCode>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| {
            error!("spawn_blocking join error: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(status_for)
}
