use thiserror::Error;

/// Store-level error taxonomy. Callers map these onto per-connection error
/// events (gateway) or status codes (REST); only the requester ever sees
/// them, they are never broadcast.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("room not found")]
    RoomNotFound,

    #[error("message not found")]
    MessageNotFound,

    #[error("{0}")]
    Validation(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl StoreError {
    /// Errors the requesting client can fix by changing its request, as
    /// opposed to storage being unavailable.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::RoomNotFound | Self::MessageNotFound | Self::Validation(_)
        )
    }
}
