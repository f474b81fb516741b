use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MessageView;

/// Events pushed from the server to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Credential verified, identity bound to this connection.
    Ready { user_id: Uuid, username: String },

    /// A newly persisted message, fanned out to every member of its room
    /// (including the sender, who reconciles by correlation token).
    MessageReceived { message: MessageView },

    /// An existing message whose reaction state changed.
    MessageUpdated { message: MessageView },

    /// A member started or stopped typing. Never sent back to the member
    /// who is typing.
    TypingChanged {
        room_id: Uuid,
        user_id: Uuid,
        username: String,
        typing: bool,
    },

    /// Room resolution failed for this connection's join request.
    RoomError { message: String },

    /// A send was rejected or failed to persist.
    MessageError { message: String },

    /// A reaction toggle was rejected or failed to persist.
    ReactionError { message: String },

    /// Credential invalid or missing; the connection is closed after this.
    AuthError { message: String },
}

/// Commands sent from a client to the server over the gateway socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Join a room, implicitly leaving the previous one.
    Join { room_id: Uuid },

    /// Send a message to the currently joined room. The correlation token,
    /// if present, is a client-generated opaque string echoed verbatim in
    /// the confirmed broadcast.
    Send {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_token: Option<String>,
    },

    /// Flip this user's reaction on a message. The acting identity is the
    /// authenticated connection's, never taken from the payload.
    ToggleReaction { message_id: Uuid, emoji: String },

    /// Typing indicator; auto-expires server-side after an idle window.
    Typing,

    StopTyping,
}
