use std::collections::HashSet;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Statistics about active rooms and connections.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RegistryStats {
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// One registered websocket connection.
pub struct Connection {
    pub user_id: String,
    pub room_id: String,
    sender: mpsc::UnboundedSender<Vec<u8>>,
    /// Documents this connection has completed a sync handshake for.
    /// Saved-acks only go to subscribers.
    subscriptions: std::sync::Mutex<HashSet<String>>,
}

impl Connection {
    fn send(&self, frame: &[u8]) -> bool {
        self.sender.send(frame.to_vec()).is_ok()
    }
}

/// Global registry of rooms, connections, and presence.
///
/// All maps are keyed so that lookups on the broadcast path never walk
/// the full connection set of the server, only the target room.
pub struct Registry {
    /// room_id -> connection ids in that room.
    rooms: DashMap<String, HashSet<Uuid>>,
    /// connection id -> connection.
    connections: DashMap<Uuid, Connection>,
    /// (user_id, room_id) -> connection id, for duplicate takeover.
    by_user_room: DashMap<(String, String), Uuid>,
    /// user_id -> all connection ids, across rooms.
    by_user: DashMap<String, HashSet<Uuid>>,
    /// (user_id, document_id) -> last presence payload, replayed to joiners.
    presence: DashMap<(String, String), Value>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            connections: DashMap::new(),
            by_user_room: DashMap::new(),
            by_user: DashMap::new(),
            presence: DashMap::new(),
        }
    }

    /// Register a connection in a room.
    ///
    /// If the same user already holds a connection in this room, the
    /// old one is evicted: its outbound sender is dropped, which ends
    /// its write loop and closes the socket. Document subscriptions
    /// carry over to the new connection so saved-acks keep arriving
    /// without a re-sync. Returns the evicted connection id, if any.
    pub fn register(
        &self,
        conn_id: Uuid,
        user_id: &str,
        room_id: &str,
        sender: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Option<Uuid> {
        let evicted = self
            .by_user_room
            .insert((user_id.to_string(), room_id.to_string()), conn_id)
            .filter(|old| *old != conn_id);

        let mut inherited = HashSet::new();
        if let Some(old) = evicted {
            info!(user_id, room_id, old_conn = %old, "evicting duplicate connection");
            if let Some(conn) = self.remove_connection_only(old) {
                inherited = conn.subscriptions.into_inner().unwrap();
            }
        }

        self.connections.insert(
            conn_id,
            Connection {
                user_id: user_id.to_string(),
                room_id: room_id.to_string(),
                sender,
                subscriptions: std::sync::Mutex::new(inherited),
            },
        );
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(conn_id);
        self.by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id);

        debug!(user_id, room_id, conn = %conn_id, "connection registered");
        evicted
    }

    /// Remove a connection and all state derived from it. Returns the
    /// (user_id, room_id) pair so the caller can announce the departure.
    pub fn unregister(&self, conn_id: Uuid) -> Option<(String, String)> {
        let conn = self.remove_connection_only(conn_id)?;

        // Only clear the user->conn mapping if it still points at us;
        // a takeover may have already replaced it.
        self.by_user_room.remove_if(
            &(conn.user_id.clone(), conn.room_id.clone()),
            |_, current| *current == conn_id,
        );

        debug!(user_id = %conn.user_id, room_id = %conn.room_id, conn = %conn_id, "connection removed");
        Some((conn.user_id, conn.room_id))
    }

    /// Drop a connection's entry without touching by_user_room, used
    /// during takeover where the map already points at the new holder.
    fn remove_connection_only(&self, conn_id: Uuid) -> Option<Connection> {
        let (_, conn) = self.connections.remove(&conn_id)?;
        if let Some(mut members) = self.rooms.get_mut(&conn.room_id) {
            members.remove(&conn_id);
        }
        self.rooms
            .remove_if(&conn.room_id, |_, members| members.is_empty());
        if let Some(mut conns) = self.by_user.get_mut(&conn.user_id) {
            conns.remove(&conn_id);
        }
        self.by_user
            .remove_if(&conn.user_id, |_, conns| conns.is_empty());
        Some(conn)
    }

    /// Send one frame to a single connection. Returns false if the
    /// connection is gone or its channel is closed.
    pub fn send_to(&self, conn_id: Uuid, frame: &[u8]) -> bool {
        self.connections
            .get(&conn_id)
            .map(|conn| conn.send(frame))
            .unwrap_or(false)
    }

    /// Broadcast a frame to every connection in a room, optionally
    /// skipping one user. Dead channels are pruned as they are found.
    pub fn broadcast(&self, room_id: &str, frame: &[u8], exclude_user: Option<&str>) {
        self.broadcast_batch(room_id, &[frame], exclude_user);
    }

    /// Broadcast several frames to a room in one pass over its
    /// members. Each connection receives the frames in order; a send
    /// failure marks the connection dead and skips its remainder.
    pub fn broadcast_batch<F: AsRef<[u8]>>(
        &self,
        room_id: &str,
        frames: &[F],
        exclude_user: Option<&str>,
    ) {
        let members: Vec<Uuid> = match self.rooms.get(room_id) {
            Some(members) => members.iter().copied().collect(),
            None => return,
        };

        let mut dead = Vec::new();
        for conn_id in members {
            if let Some(conn) = self.connections.get(&conn_id) {
                if exclude_user.is_some_and(|u| u == conn.user_id) {
                    continue;
                }
                if frames.iter().any(|frame| !conn.send(frame.as_ref())) {
                    dead.push(conn_id);
                }
            }
        }
        for conn_id in dead {
            self.unregister(conn_id);
        }
    }

    /// Whether a user still holds any live connection, in any room.
    pub fn user_has_connections(&self, user_id: &str) -> bool {
        self.by_user
            .get(user_id)
            .map(|conns| !conns.is_empty())
            .unwrap_or(false)
    }

    /// Broadcast a frame only to connections subscribed to a document.
    pub fn send_to_subscribers(&self, room_id: &str, document_id: &str, frame: &[u8]) {
        let members: Vec<Uuid> = match self.rooms.get(room_id) {
            Some(members) => members.iter().copied().collect(),
            None => return,
        };

        for conn_id in members {
            if let Some(conn) = self.connections.get(&conn_id) {
                let subscribed = conn
                    .subscriptions
                    .lock()
                    .unwrap()
                    .contains(document_id);
                if subscribed {
                    conn.send(frame);
                }
            }
        }
    }

    /// Mark a connection as synced on a document.
    pub fn subscribe_document(&self, conn_id: Uuid, document_id: &str) {
        if let Some(conn) = self.connections.get(&conn_id) {
            conn.subscriptions
                .lock()
                .unwrap()
                .insert(document_id.to_string());
        }
    }

    /// Send one frame to a user, preferring their connection in
    /// `room_id` and falling back to any other connection they hold.
    /// Returns false when the user has no reachable connection.
    pub fn send_to_user(&self, user_id: &str, room_id: &str, frame: &[u8]) -> bool {
        if let Some(conn_id) = self
            .by_user_room
            .get(&(user_id.to_string(), room_id.to_string()))
            .map(|e| *e)
        {
            if self.send_to(conn_id, frame) {
                return true;
            }
        }

        let fallbacks: Vec<Uuid> = self
            .by_user
            .get(user_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default();
        fallbacks.into_iter().any(|conn_id| self.send_to(conn_id, frame))
    }

    /// Drop every connection, closing all sockets. Used at shutdown
    /// after the listener stops accepting.
    pub fn drain_and_close(&self) {
        let all: Vec<Uuid> = self.connections.iter().map(|e| *e.key()).collect();
        for conn_id in all {
            self.unregister(conn_id);
        }
        self.presence.clear();
        info!("registry drained");
    }

    pub fn room_of(&self, conn_id: Uuid) -> Option<String> {
        self.connections.get(&conn_id).map(|c| c.room_id.clone())
    }

    pub fn room_is_empty(&self, room_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|members| members.is_empty())
            .unwrap_or(true)
    }

    /// Record the latest presence payload for a user on a document.
    pub fn set_presence(&self, user_id: &str, document_id: &str, state: Value) {
        self.presence
            .insert((user_id.to_string(), document_id.to_string()), state);
    }

    /// Drop all presence rows for a user, returning the document ids
    /// that carried one so removals can be announced.
    pub fn clear_presence(&self, user_id: &str) -> Vec<String> {
        let keys: Vec<(String, String)> = self
            .presence
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| entry.key().clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.presence.remove(&key).map(|_| key.1))
            .collect()
    }

    /// Presence snapshot for one document, replayed to late joiners.
    pub fn presence_for(&self, document_id: &str) -> Vec<(String, Value)> {
        self.presence
            .iter()
            .filter(|entry| entry.key().1 == document_id)
            .map(|entry| (entry.key().0.clone(), entry.value().clone()))
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_connections: self.connections.len(),
            active_rooms: self.rooms.len(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (
        mpsc::UnboundedSender<Vec<u8>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_register_and_broadcast() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        registry.register(Uuid::new_v4(), "alice", "room-1", tx_a);
        registry.register(Uuid::new_v4(), "bob", "room-1", tx_b);

        registry.broadcast("room-1", b"hello", None);
        assert_eq!(rx_a.try_recv().unwrap(), b"hello");
        assert_eq!(rx_b.try_recv().unwrap(), b"hello");
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        registry.register(Uuid::new_v4(), "alice", "room-1", tx_a);
        registry.register(Uuid::new_v4(), "bob", "room-1", tx_b);

        registry.broadcast("room-1", b"from-alice", Some("alice"));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), b"from-alice");
    }

    #[test]
    fn test_broadcast_batch_keeps_order_and_exclusion() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        registry.register(Uuid::new_v4(), "alice", "room-1", tx_a);
        registry.register(Uuid::new_v4(), "bob", "room-1", tx_b);

        registry.broadcast_batch(
            "room-1",
            &[b"one".to_vec(), b"two".to_vec()],
            Some("alice"),
        );
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), b"one");
        assert_eq!(rx_b.try_recv().unwrap(), b"two");
    }

    #[test]
    fn test_duplicate_user_takeover() {
        let registry = Registry::new();
        let (tx_old, _rx_old) = channel();
        let (tx_new, mut rx_new) = channel();

        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        registry.register(old, "alice", "room-1", tx_old);
        let evicted = registry.register(new, "alice", "room-1", tx_new);

        assert_eq!(evicted, Some(old));
        // Old connection is gone; new one still receives.
        registry.broadcast("room-1", b"ping", None);
        assert_eq!(rx_new.try_recv().unwrap(), b"ping");
        assert_eq!(registry.stats().active_connections, 1);
    }

    #[test]
    fn test_unregister_after_takeover_keeps_new_mapping() {
        let registry = Registry::new();
        let (tx_old, _rx_old) = channel();
        let (tx_new, _rx_new) = channel();

        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        registry.register(old, "alice", "room-1", tx_old);
        registry.register(new, "alice", "room-1", tx_new);

        // A late disconnect event for the evicted connection must not
        // tear down the new one's user mapping.
        registry.unregister(old);
        assert_eq!(
            registry.by_user_room.get(&("alice".into(), "room-1".into())).map(|e| *e),
            Some(new)
        );
    }

    #[test]
    fn test_dead_channel_pruned_on_broadcast() {
        let registry = Registry::new();
        let (tx_a, rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        registry.register(Uuid::new_v4(), "alice", "room-1", tx_a);
        registry.register(Uuid::new_v4(), "bob", "room-1", tx_b);
        drop(rx_a);

        registry.broadcast("room-1", b"x", None);
        assert_eq!(registry.stats().active_connections, 1);
        assert_eq!(rx_b.try_recv().unwrap(), b"x");
    }

    #[test]
    fn test_saved_ack_only_reaches_subscribers() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.register(a, "alice", "room-1", tx_a);
        registry.register(b, "bob", "room-1", tx_b);
        registry.subscribe_document(a, "doc-1");

        registry.send_to_subscribers("room-1", "doc-1", b"saved");
        assert_eq!(rx_a.try_recv().unwrap(), b"saved");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_takeover_inherits_subscriptions() {
        let registry = Registry::new();
        let (tx_old, _rx_old) = channel();
        let (tx_new, mut rx_new) = channel();

        let old = Uuid::new_v4();
        registry.register(old, "alice", "room-1", tx_old);
        registry.subscribe_document(old, "doc-1");

        registry.register(Uuid::new_v4(), "alice", "room-1", tx_new);
        registry.send_to_subscribers("room-1", "doc-1", b"saved");
        assert_eq!(rx_new.try_recv().unwrap(), b"saved");
    }

    #[test]
    fn test_send_to_user_prefers_room_connection() {
        let registry = Registry::new();
        let (tx_r1, mut rx_r1) = channel();
        let (tx_r2, mut rx_r2) = channel();

        registry.register(Uuid::new_v4(), "alice", "room-1", tx_r1);
        registry.register(Uuid::new_v4(), "alice", "room-2", tx_r2);

        assert!(registry.send_to_user("alice", "room-1", b"direct"));
        assert_eq!(rx_r1.try_recv().unwrap(), b"direct");
        assert!(rx_r2.try_recv().is_err());

        // Unknown room falls back to any connection the user holds.
        assert!(registry.send_to_user("alice", "room-9", b"fallback"));
        assert!(!registry.send_to_user("nobody", "room-1", b"x"));
    }

    #[test]
    fn test_drain_and_close() {
        let registry = Registry::new();
        let (tx, _rx) = channel();
        registry.register(Uuid::new_v4(), "alice", "room-1", tx);
        registry.set_presence("alice", "doc-1", serde_json::json!({}));

        registry.drain_and_close();
        assert_eq!(registry.stats().active_connections, 0);
        assert_eq!(registry.stats().active_rooms, 0);
        assert!(registry.presence_for("doc-1").is_empty());
    }

    #[test]
    fn test_presence_snapshot_and_clear() {
        let registry = Registry::new();
        registry.set_presence("alice", "doc-1", serde_json::json!({"color": "red"}));
        registry.set_presence("alice", "doc-2", serde_json::json!({"color": "red"}));
        registry.set_presence("bob", "doc-1", serde_json::json!({"color": "blue"}));

        assert_eq!(registry.presence_for("doc-1").len(), 2);

        let mut cleared = registry.clear_presence("alice");
        cleared.sort();
        assert_eq!(cleared, vec!["doc-1".to_string(), "doc-2".to_string()]);
        assert_eq!(registry.presence_for("doc-1").len(), 1);
    }

    #[test]
    fn test_room_emptiness() {
        let registry = Registry::new();
        assert!(registry.room_is_empty("room-1"));

        let (tx, _rx) = channel();
        let id = Uuid::new_v4();
        registry.register(id, "alice", "room-1", tx);
        assert!(!registry.room_is_empty("room-1"));

        registry.unregister(id);
        assert!(registry.room_is_empty("room-1"));
        assert_eq!(registry.stats().active_rooms, 0);
    }
}
