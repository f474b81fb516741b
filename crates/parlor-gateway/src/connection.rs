//! Per-connection WebSocket handling: the Connecting → Authenticated →
//! Joined state machine, the command loop, and the typing idle timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{decode, DecodingKey, Validation};
use tracing::{info, warn};
use uuid::Uuid;

use parlor_types::api::Claims;
use parlor_types::events::{ClientCommand, ServerEvent};

use crate::dispatcher::{Dispatcher, Session};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Typing indicators auto-expire after this idle window.
const TYPING_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle one gateway connection end to end. The credential is verified
/// exactly once, here; a bad or missing token produces a single `authError`
/// event and the connection never reaches `Authenticated`.
pub async fn handle_connection(
    mut socket: WebSocket,
    dispatcher: Dispatcher,
    token: Option<String>,
    jwt_secret: &str,
) {
    let claims = match verify_token(token.as_deref(), jwt_secret) {
        Some(claims) => claims,
        None => {
            let event = ServerEvent::AuthError {
                message: "Invalid or missing credential.".into(),
            };
            let _ = socket
                .send(Message::Text(
                    serde_json::to_string(&event).unwrap().into(),
                ))
                .await;
            let _ = socket.close().await;
            warn!("gateway connection rejected: bad credential");
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();
    let (mut session, mut event_rx) = Session::new(claims.sub, claims.username);
    info!(
        "{} ({}) connected to gateway",
        session.username, session.user_id
    );

    // Make the identity resolvable in broadcast payloads.
    dispatcher
        .register_identity(session.user_id, &session.username)
        .await;

    let ready = ServerEvent::Ready {
        user_id: session.user_id,
        username: session.username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward dispatched events to the client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout, dropping connection");
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut typing = TypingTimer::default();

    // Command loop. Runs until the client closes, the socket errors, or the
    // send half dies (heartbeat timeout).
    loop {
        tokio::select! {
            _ = &mut send_task => break,
            msg = receiver.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(cmd) => {
                            handle_command(&dispatcher, &mut session, &mut typing, cmd).await;
                        }
                        Err(err) => {
                            let preview: String = text.chars().take(200).collect();
                            warn!(
                                "{} ({}) bad command: {} -- raw: {}",
                                session.username, session.user_id, err, preview
                            );
                            push(&session, ServerEvent::MessageError {
                                message: "Unrecognized command.".into(),
                            });
                        }
                    },
                    Message::Pong(_) => {
                        pong_flag_recv.store(true, Ordering::Release);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    // Disconnect: cancel the typing timer and drop all room membership,
    // even if a broadcast is in flight to this connection's buffer.
    send_task.abort();
    typing.cancel();
    dispatcher.leave(&mut session).await;
    info!(
        "{} ({}) disconnected from gateway",
        session.username, session.user_id
    );
}

fn verify_token(token: Option<&str>, jwt_secret: &str) -> Option<Claims> {
    let token = token?;
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

/// Deliver an event to this connection only. A full or closed buffer is the
/// transport's problem, not ours.
fn push(session: &Session, event: ServerEvent) {
    let _ = session.tx.send(event);
}

async fn handle_command(
    dispatcher: &Dispatcher,
    session: &mut Session,
    typing: &mut TypingTimer,
    cmd: ClientCommand,
) {
    match cmd {
        ClientCommand::Join { room_id } => {
            // Switching rooms invalidates any typing state in the old one.
            typing.cancel();
            match dispatcher.join(session, room_id).await {
                Ok(()) => {
                    info!(
                        "{} ({}) joined room {}",
                        session.username, session.user_id, room_id
                    );
                }
                Err(err) => {
                    push(
                        session,
                        ServerEvent::RoomError {
                            message: err.client_message("Failed to join room."),
                        },
                    );
                }
            }
        }

        ClientCommand::Send {
            content,
            correlation_token,
        } => {
            let Some(room_id) = session.room else {
                push(
                    session,
                    ServerEvent::MessageError {
                        message: "Join a room before sending messages.".into(),
                    },
                );
                return;
            };
            if content.trim().is_empty() {
                push(
                    session,
                    ServerEvent::MessageError {
                        message: "Message content cannot be empty.".into(),
                    },
                );
                return;
            }
            if let Err(err) = dispatcher
                .send_message(session, room_id, content, correlation_token)
                .await
            {
                warn!(
                    "{} ({}) send failed: {err}",
                    session.username, session.user_id
                );
                push(
                    session,
                    ServerEvent::MessageError {
                        message: err.client_message("Failed to send message."),
                    },
                );
            }
        }

        ClientCommand::ToggleReaction { message_id, emoji } => {
            // Acting identity comes from the authenticated session, never
            // from the payload.
            if let Err(err) = dispatcher
                .toggle_reaction(session.user_id, message_id, emoji)
                .await
            {
                warn!(
                    "{} ({}) reaction toggle failed: {err}",
                    session.username, session.user_id
                );
                push(
                    session,
                    ServerEvent::ReactionError {
                        message: err.client_message("Failed to toggle reaction."),
                    },
                );
            }
        }

        ClientCommand::Typing => {
            let Some(room_id) = session.room else {
                push(
                    session,
                    ServerEvent::RoomError {
                        message: "Join a room before typing.".into(),
                    },
                );
                return;
            };
            dispatcher.set_typing(session, room_id, true).await;
            typing.arm(
                dispatcher.clone(),
                room_id,
                session.conn_id,
                session.user_id,
                session.username.clone(),
            );
        }

        ClientCommand::StopTyping => {
            let Some(room_id) = session.room else {
                push(
                    session,
                    ServerEvent::RoomError {
                        message: "Join a room before typing.".into(),
                    },
                );
                return;
            };
            typing.cancel();
            dispatcher.set_typing(session, room_id, false).await;
        }
    }
}

/// Cooperative idle timeout for the typing indicator, scoped to the
/// connection: re-armed on every keystroke event, cancelled on stop-typing,
/// room switch and disconnect.
#[derive(Default)]
struct TypingTimer {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TypingTimer {
    fn arm(
        &mut self,
        dispatcher: Dispatcher,
        room_id: Uuid,
        conn_id: Uuid,
        user_id: Uuid,
        username: String,
    ) {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(TYPING_IDLE_TIMEOUT).await;
            dispatcher
                .notify_typing(room_id, conn_id, user_id, &username, false)
                .await;
        }));
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TypingTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
