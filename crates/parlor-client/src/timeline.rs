//! Client-side message timeline with optimistic-update reconciliation.
//!
//! Composing injects a provisional message keyed by a generated correlation
//! token; the server echoes the token verbatim in the confirmed broadcast,
//! which replaces the provisional entry in place. Matching is by server id
//! first, then by token, then append, so a sender receiving its own
//! broadcast never shows two copies. Tokens are held until confirmed or
//! explicitly abandoned; there is no content/timestamp heuristic fallback.

use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use parlor_types::events::ClientCommand;
use parlor_types::models::{MessageView, Sentiment, UserRef};

/// One visible message. `pending` marks a provisional entry still awaiting
/// its server confirmation.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub message: MessageView,
    pub pending: bool,
}

/// The messages of one room as the client renders them.
#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    /// Server id -> position, for O(1) in-place updates.
    by_id: HashMap<Uuid, usize>,
    /// Outstanding correlation tokens -> position of the provisional entry.
    by_token: HashMap<String, usize>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the timeline from a history page (ascending order).
    pub fn load_history(&mut self, items: Vec<MessageView>) {
        for message in items {
            self.upsert_confirmed(message);
        }
    }

    /// Compose a message: inject a provisional entry and return the command
    /// to put on the wire, correlation token attached.
    pub fn compose(&mut self, room_id: Uuid, sender: UserRef, content: &str) -> ClientCommand {
        let token = Uuid::new_v4().to_string();
        let provisional = MessageView {
            // Placeholder until the server assigns the real identifier.
            id: Uuid::nil(),
            room_id,
            sender,
            content: content.trim().to_string(),
            sentiment: Sentiment::Neutral,
            created_at: Utc::now(),
            reactions: Vec::new(),
            correlation_token: Some(token.clone()),
        };

        self.by_token.insert(token.clone(), self.entries.len());
        self.entries.push(TimelineEntry {
            message: provisional,
            pending: true,
        });

        ClientCommand::Send {
            content: content.trim().to_string(),
            correlation_token: Some(token),
        }
    }

    /// Apply an inbound `messageReceived` or `messageUpdated` event. The
    /// same reconciliation runs for both: update by id, else replace the
    /// matching provisional entry, else append.
    pub fn apply(&mut self, message: MessageView) {
        self.upsert_confirmed(message);
    }

    /// Give up on an outstanding token (e.g. the send errored). The
    /// provisional entry is removed so it cannot linger as a ghost.
    pub fn abandon(&mut self, token: &str) {
        let Some(pos) = self.by_token.remove(token) else {
            return;
        };
        self.entries.remove(pos);
        self.reindex_from(pos);
    }

    /// Tokens still awaiting confirmation.
    pub fn outstanding_tokens(&self) -> impl Iterator<Item = &str> {
        self.by_token.keys().map(String::as_str)
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn upsert_confirmed(&mut self, message: MessageView) {
        // Already known by server id: update in place (reaction changes,
        // redelivery).
        if message.id != Uuid::nil() {
            if let Some(&pos) = self.by_id.get(&message.id) {
                let pending = &mut self.entries[pos];
                pending.message = message;
                pending.pending = false;
                return;
            }
        }

        // A provisional entry we originated: confirm it in place, keeping
        // its position.
        if let Some(token) = message.correlation_token.clone() {
            if let Some(pos) = self.by_token.remove(&token) {
                debug!("confirmed provisional message for token {token}");
                self.by_id.insert(message.id, pos);
                self.entries[pos] = TimelineEntry {
                    message,
                    pending: false,
                };
                return;
            }
        }

        // Someone else's message: append.
        self.by_id.insert(message.id, self.entries.len());
        self.entries.push(TimelineEntry {
            message,
            pending: false,
        });
    }

    fn reindex_from(&mut self, pos: usize) {
        for (i, entry) in self.entries.iter().enumerate().skip(pos) {
            if entry.message.id != Uuid::nil() {
                self.by_id.insert(entry.message.id, i);
            } else if let Some(token) = &entry.message.correlation_token {
                self.by_token.insert(token.clone(), i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserRef {
        UserRef {
            id: Uuid::new_v4(),
            username: name.into(),
        }
    }

    fn confirmed(room_id: Uuid, sender: &UserRef, content: &str, token: Option<&str>) -> MessageView {
        MessageView {
            id: Uuid::new_v4(),
            room_id,
            sender: sender.clone(),
            content: content.into(),
            sentiment: Sentiment::Neutral,
            created_at: Utc::now(),
            reactions: Vec::new(),
            correlation_token: token.map(String::from),
        }
    }

    #[test]
    fn own_broadcast_yields_exactly_one_visible_message() {
        let room = Uuid::new_v4();
        let me = user("u1");
        let mut timeline = Timeline::new();

        let cmd = timeline.compose(room, me.clone(), "hello");
        let token = match cmd {
            ClientCommand::Send {
                correlation_token, ..
            } => correlation_token.unwrap(),
            other => panic!("unexpected command: {other:?}"),
        };
        assert_eq!(timeline.len(), 1);
        assert!(timeline.entries()[0].pending);

        // The server's confirmation arrives, token echoed verbatim.
        let broadcast = confirmed(room, &me, "hello", Some(&token));
        let server_id = broadcast.id;
        timeline.apply(broadcast);

        assert_eq!(timeline.len(), 1, "never two visible copies");
        let entry = &timeline.entries()[0];
        assert!(!entry.pending);
        assert_eq!(entry.message.id, server_id);
        assert_eq!(timeline.outstanding_tokens().count(), 0);
    }

    #[test]
    fn foreign_messages_append_in_arrival_order() {
        let room = Uuid::new_v4();
        let other = user("u2");
        let mut timeline = Timeline::new();

        timeline.apply(confirmed(room, &other, "one", None));
        timeline.apply(confirmed(room, &other, "two", None));
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.entries()[0].message.content, "one");
        assert_eq!(timeline.entries()[1].message.content, "two");
    }

    #[test]
    fn update_by_id_replaces_in_place() {
        let room = Uuid::new_v4();
        let other = user("u2");
        let mut timeline = Timeline::new();

        let original = confirmed(room, &other, "react to me", None);
        let id = original.id;
        timeline.apply(original.clone());
        timeline.apply(confirmed(room, &other, "later", None));

        let mut updated = original;
        updated.reactions.push(parlor_types::models::ReactionView {
            emoji: "👍".into(),
            count: 1,
            users: vec![other.clone()],
        });
        timeline.apply(updated);

        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.entries()[0].message.id, id);
        assert_eq!(timeline.entries()[0].message.reactions.len(), 1);
    }

    #[test]
    fn confirmation_preserves_position_between_neighbors() {
        let room = Uuid::new_v4();
        let me = user("u1");
        let other = user("u2");
        let mut timeline = Timeline::new();

        timeline.apply(confirmed(room, &other, "before", None));
        let cmd = timeline.compose(room, me.clone(), "mine");
        let token = match cmd {
            ClientCommand::Send {
                correlation_token, ..
            } => correlation_token.unwrap(),
            other => panic!("unexpected command: {other:?}"),
        };
        timeline.apply(confirmed(room, &other, "after", None));

        timeline.apply(confirmed(room, &me, "mine", Some(&token)));
        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline.entries()[1].message.content, "mine");
        assert!(!timeline.entries()[1].pending);
    }

    #[test]
    fn someone_elses_token_does_not_match_ours() {
        let room = Uuid::new_v4();
        let me = user("u1");
        let other = user("u2");
        let mut timeline = Timeline::new();

        timeline.compose(room, me, "mine");
        // A different client's token arrives in the broadcast; it must
        // append, not swallow our provisional entry.
        timeline.apply(confirmed(room, &other, "theirs", Some("not-our-token")));

        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.outstanding_tokens().count(), 1);
    }

    #[test]
    fn abandon_removes_the_ghost_and_reindexes() {
        let room = Uuid::new_v4();
        let me = user("u1");
        let other = user("u2");
        let mut timeline = Timeline::new();

        let cmd = timeline.compose(room, me, "doomed");
        let token = match cmd {
            ClientCommand::Send {
                correlation_token, ..
            } => correlation_token.unwrap(),
            other => panic!("unexpected command: {other:?}"),
        };
        let keeper = confirmed(room, &other, "kept", None);
        let keeper_id = keeper.id;
        timeline.apply(keeper);

        timeline.abandon(&token);
        assert_eq!(timeline.len(), 1);

        // Index still valid: an update to the surviving message lands on it.
        let mut updated = confirmed(room, &other, "kept (edited view)", None);
        updated.id = keeper_id;
        timeline.apply(updated);
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.entries()[0].message.content, "kept (edited view)");
    }
}
