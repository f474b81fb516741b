//! The event router: room membership fan-out and the authoritative
//! sequencing of join, send, react and typing events.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;
use uuid::Uuid;

use parlor_db::{Database, StoreError};
use parlor_types::events::ServerEvent;

use crate::sentiment::SentimentClient;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DispatchError {
    /// The message shown to the requesting client. Client-correctable
    /// store errors are passed through; anything else stays generic so
    /// storage details never leak over the wire.
    pub fn client_message(&self, fallback: &str) -> String {
        match self {
            Self::Store(err) if err.is_client_error() => err.to_string(),
            _ => fallback.to_string(),
        }
    }
}

/// Per-connection session state, owned exclusively by the connection task.
/// A session is in at most one room; joining another room implicitly
/// leaves the previous one.
pub struct Session {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub room: Option<Uuid>,
    pub tx: mpsc::UnboundedSender<ServerEvent>,
}

impl Session {
    pub fn new(user_id: Uuid, username: String) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                user_id,
                username,
                room: None,
                tx,
            },
            rx,
        )
    }
}

/// Routes inbound events to the store and fans resulting state changes out
/// to every connection joined to the affected room.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    db: Arc<Database>,
    sentiment: SentimentClient,
    /// Live membership, one channel per room. The outer map is only taken
    /// to look up or create a channel; all membership mutation happens
    /// under the room's own lock, so traffic in unrelated rooms never
    /// serializes.
    rooms: RwLock<HashMap<Uuid, Arc<RoomChannel>>>,
}

struct RoomChannel {
    members: std::sync::Mutex<HashMap<Uuid, mpsc::UnboundedSender<ServerEvent>>>,
    /// Held across append + fan-out so broadcast order equals commit order
    /// within the room.
    send_order: tokio::sync::Mutex<()>,
}

impl RoomChannel {
    fn new() -> Self {
        Self {
            members: std::sync::Mutex::new(HashMap::new()),
            send_order: tokio::sync::Mutex::new(()),
        }
    }

    fn fan_out(&self, event: &ServerEvent, except: Option<Uuid>) {
        let members = self.members.lock().expect("room membership lock poisoned");
        for (&conn_id, tx) in members.iter() {
            if Some(conn_id) == except {
                continue;
            }
            // A member may have just disconnected; the transport absorbs
            // the dropped receiver silently.
            let _ = tx.send(event.clone());
        }
    }
}

impl Dispatcher {
    pub fn new(db: Arc<Database>, sentiment: SentimentClient) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                db,
                sentiment,
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.inner.db
    }

    /// Join a room, leaving the previous one first. Fails with
    /// `RoomNotFound` before touching membership, so fan-out registration
    /// never exists for a nonexistent room.
    pub async fn join(&self, session: &mut Session, room_id: Uuid) -> Result<(), DispatchError> {
        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || db.get_room(room_id)).await??;

        if let Some(previous) = session.room.take() {
            self.remove_member(previous, session.conn_id).await;
        }

        let channel = self.room_channel(room_id).await;
        channel
            .members
            .lock()
            .expect("room membership lock poisoned")
            .insert(session.conn_id, session.tx.clone());
        session.room = Some(room_id);
        Ok(())
    }

    /// Disconnect cleanup: the session must not remain in any room's
    /// membership set.
    pub async fn leave(&self, session: &mut Session) {
        if let Some(room_id) = session.room.take() {
            self.remove_member(room_id, session.conn_id).await;
        }
    }

    /// Persist a message to the session's current room and broadcast the
    /// confirmed message, correlation token echoed verbatim, to every
    /// member including the sender.
    pub async fn send_message(
        &self,
        session: &Session,
        room_id: Uuid,
        content: String,
        correlation_token: Option<String>,
    ) -> Result<(), DispatchError> {
        // Best-effort annotation, bounded by its own timeout; never blocks
        // persistence beyond that.
        let sentiment = self.inner.sentiment.analyze(&content).await;

        let channel = self.room_channel(room_id).await;
        let _order = channel.send_order.lock().await;

        let db = self.inner.db.clone();
        let sender_id = session.user_id;
        let mut message = tokio::task::spawn_blocking(move || {
            db.append_message(sender_id, room_id, &content, sentiment)
        })
        .await??;
        message.correlation_token = correlation_token;

        channel.fan_out(&ServerEvent::MessageReceived { message }, None);
        Ok(())
    }

    /// Toggle the acting user's reaction and broadcast the updated message
    /// to the members of that message's room.
    pub async fn toggle_reaction(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        emoji: String,
    ) -> Result<(), DispatchError> {
        let db = self.inner.db.clone();
        let message = tokio::task::spawn_blocking(move || {
            db.toggle_reaction(message_id, &emoji, user_id)
        })
        .await??;

        let channel = self.room_channel(message.room_id).await;
        channel.fan_out(&ServerEvent::MessageUpdated { message }, None);
        Ok(())
    }

    /// Broadcast a typing-state change to the other members of the
    /// session's room. Purely transient; nothing is persisted.
    pub async fn set_typing(&self, session: &Session, room_id: Uuid, typing: bool) {
        self.notify_typing(room_id, session.conn_id, session.user_id, &session.username, typing)
            .await;
    }

    /// Typing-state broadcast by raw identity, used by the idle-timeout
    /// timer after it has outlived its borrow of the session.
    pub async fn notify_typing(
        &self,
        room_id: Uuid,
        conn_id: Uuid,
        user_id: Uuid,
        username: &str,
        typing: bool,
    ) {
        let channel = self.room_channel(room_id).await;
        channel.fan_out(
            &ServerEvent::TypingChanged {
                room_id,
                user_id,
                username: username.to_string(),
                typing,
            },
            Some(conn_id),
        );
    }

    /// Record display data for a verified identity so broadcast payloads
    /// can resolve it. Failure is logged, never fatal to the connection.
    pub async fn register_identity(&self, user_id: Uuid, username: &str) {
        let db = self.inner.db.clone();
        let username = username.to_string();
        let result =
            tokio::task::spawn_blocking(move || db.upsert_user(user_id, &username)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("failed to record user identity: {err}"),
            Err(err) => warn!("identity task failed: {err}"),
        }
    }

    async fn room_channel(&self, room_id: Uuid) -> Arc<RoomChannel> {
        {
            let rooms = self.inner.rooms.read().await;
            if let Some(channel) = rooms.get(&room_id) {
                return channel.clone();
            }
        }
        let mut rooms = self.inner.rooms.write().await;
        rooms
            .entry(room_id)
            .or_insert_with(|| Arc::new(RoomChannel::new()))
            .clone()
    }

    async fn remove_member(&self, room_id: Uuid, conn_id: Uuid) {
        let rooms = self.inner.rooms.read().await;
        if let Some(channel) = rooms.get(&room_id) {
            channel
                .members
                .lock()
                .expect("room membership lock poisoned")
                .remove(&conn_id);
        }
    }

    #[cfg(test)]
    async fn members_of(&self, room_id: Uuid) -> Vec<Uuid> {
        let rooms = self.inner.rooms.read().await;
        match rooms.get(&room_id) {
            Some(channel) => channel
                .members
                .lock()
                .expect("room membership lock poisoned")
                .keys()
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn dispatcher() -> Dispatcher {
        let db = Arc::new(Database::open_in_memory().unwrap());
        Dispatcher::new(db, SentimentClient::disabled())
    }

    fn session(name: &str) -> (Session, UnboundedReceiver<ServerEvent>) {
        Session::new(Uuid::new_v4(), name.to_string())
    }

    async fn joined_pair(
        dispatcher: &Dispatcher,
    ) -> (
        Uuid,
        (Session, UnboundedReceiver<ServerEvent>),
        (Session, UnboundedReceiver<ServerEvent>),
    ) {
        let room = {
            let db = dispatcher.db().clone();
            db.ensure_prebuilt_rooms().unwrap().remove(0)
        };
        let (mut alice, alice_rx) = session("alice");
        let (mut bob, bob_rx) = session("bob");
        dispatcher.join(&mut alice, room.id).await.unwrap();
        dispatcher.join(&mut bob, room.id).await.unwrap();
        (room.id, (alice, alice_rx), (bob, bob_rx))
    }

    #[tokio::test]
    async fn join_unknown_room_registers_nothing() {
        let d = dispatcher();
        let (mut s, _rx) = session("alice");
        let bogus = Uuid::new_v4();
        let err = d.join(&mut s, bogus).await.unwrap_err();
        assert!(matches!(err, DispatchError::Store(StoreError::RoomNotFound)));
        assert!(s.room.is_none());
        assert!(d.members_of(bogus).await.is_empty());
    }

    #[tokio::test]
    async fn send_fans_out_to_all_members_including_sender() {
        let d = dispatcher();
        let (room, (alice, mut alice_rx), (_bob, mut bob_rx)) = joined_pair(&d).await;

        d.send_message(&alice, room, "hello".into(), Some("t1".into()))
            .await
            .unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            match rx.recv().await.unwrap() {
                ServerEvent::MessageReceived { message } => {
                    assert_eq!(message.content, "hello");
                    assert_eq!(message.correlation_token.as_deref(), Some("t1"));
                    assert_eq!(message.room_id, room);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn broadcast_order_matches_commit_order() {
        let d = dispatcher();
        let (room, (alice, _alice_rx), (bob, mut bob_rx)) = joined_pair(&d).await;

        for i in 0..10 {
            let sender = if i % 2 == 0 { &alice } else { &bob };
            d.send_message(sender, room, format!("m{i}"), None)
                .await
                .unwrap();
        }

        // Receiver order must equal the store's history (= commit) order.
        let mut received = Vec::new();
        for _ in 0..10 {
            match bob_rx.recv().await.unwrap() {
                ServerEvent::MessageReceived { message } => received.push(message.id),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        let history: Vec<Uuid> = d
            .db()
            .history(room, None, 100)
            .unwrap()
            .items
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(received, history);
    }

    #[tokio::test]
    async fn joining_a_second_room_leaves_the_first() {
        let d = dispatcher();
        let rooms = d.db().ensure_prebuilt_rooms().unwrap();
        let (mut alice, mut alice_rx) = session("alice");
        let (bob, _bob_rx) = {
            let (mut b, rx) = session("bob");
            d.join(&mut b, rooms[0].id).await.unwrap();
            (b, rx)
        };

        d.join(&mut alice, rooms[0].id).await.unwrap();
        d.join(&mut alice, rooms[1].id).await.unwrap();
        assert_eq!(alice.room, Some(rooms[1].id));
        assert_eq!(d.members_of(rooms[0].id).await, vec![bob.conn_id]);

        // Traffic in the old room no longer reaches alice.
        d.send_message(&bob, rooms[0].id, "still here?".into(), None)
            .await
            .unwrap();
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn toggle_broadcasts_updated_message_to_room_members() {
        let d = dispatcher();
        let (room, (alice, mut alice_rx), (bob, mut bob_rx)) = joined_pair(&d).await;

        d.send_message(&alice, room, "react to me".into(), None)
            .await
            .unwrap();
        let message_id = match alice_rx.recv().await.unwrap() {
            ServerEvent::MessageReceived { message } => message.id,
            other => panic!("unexpected event: {other:?}"),
        };
        let _ = bob_rx.recv().await.unwrap();

        d.toggle_reaction(bob.user_id, message_id, "👍".into())
            .await
            .unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            match rx.recv().await.unwrap() {
                ServerEvent::MessageUpdated { message } => {
                    assert_eq!(message.id, message_id);
                    assert_eq!(message.reactions.len(), 1);
                    assert!(message.reactions[0].reacted_by(bob.user_id));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn typing_excludes_the_originating_connection() {
        let d = dispatcher();
        let (room, (alice, mut alice_rx), (_bob, mut bob_rx)) = joined_pair(&d).await;

        d.set_typing(&alice, room, true).await;

        match bob_rx.recv().await.unwrap() {
            ServerEvent::TypingChanged {
                user_id, typing, ..
            } => {
                assert_eq!(user_id, alice.user_id);
                assert!(typing);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_clears_membership() {
        let d = dispatcher();
        let (room, (mut alice, _alice_rx), (bob, _bob_rx)) = joined_pair(&d).await;

        d.leave(&mut alice).await;
        assert!(alice.room.is_none());
        assert_eq!(d.members_of(room).await, vec![bob.conn_id]);
    }

    #[tokio::test]
    async fn send_to_expired_room_is_room_not_found() {
        let d = dispatcher();
        let db = d.db().clone();
        let room = db
            .create_temporary_room("gone", "expired", chrono::Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        let (alice, _rx) = session("alice");

        let err = d
            .send_message(&alice, room.id, "hello?".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Store(StoreError::RoomNotFound)));
    }
}
