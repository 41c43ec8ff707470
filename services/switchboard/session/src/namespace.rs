//! Namespaces and rooms.
//!
//! Rosters are shared between the owning sessions and any broadcast, local
//! or relayed from another node, so they are concurrent sets. Broadcasts work
//! on snapshots and may still see a member that has since left.
//!
//! Room members on other nodes are mirrored from the cluster bus into a
//! separate roster. They show up in [`Namespace::room_members`] but local
//! delivery only ever walks the local roster.

use crate::session::SessionId;
use crate::SessionManager;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::sync::Arc;
use switchboard_wire::ROOT_NAMESPACE;
use tracing::debug;

/// Event delivered to a namespace listener
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Namespace the event arrived on
    pub namespace: String,
    /// Event name
    pub name: String,
    /// Arguments after the name; attachments appear as base64 strings
    pub args: Vec<Value>,
    /// Ack id to answer with [`SessionManager::send_ack`], if requested
    pub ack_id: Option<u64>,
    /// Raw attachments of a binary event
    pub attachments: Vec<Bytes>,
}

/// Application hooks of one namespace
pub trait NamespaceListener: Send + Sync {
    /// Session completed CONNECT on the namespace
    fn on_connect(&self, _manager: &SessionManager, _sid: SessionId, _namespace: &str) {}

    /// Session left the namespace or closed
    fn on_disconnect(&self, _manager: &SessionManager, _sid: SessionId, _namespace: &str) {}

    /// Event from a session
    fn on_event(&self, _manager: &SessionManager, _sid: SessionId, _event: InboundEvent) {}
}

/// One namespace with its member and room rosters
pub struct Namespace {
    name: String,
    members: DashSet<SessionId>,
    rooms: DashMap<String, DashSet<SessionId>>,
    remote_rooms: DashMap<String, DashSet<SessionId>>,
    listener: Option<Arc<dyn NamespaceListener>>,
}

impl Namespace {
    fn new(name: String, listener: Option<Arc<dyn NamespaceListener>>) -> Self {
        Self {
            name,
            members: DashSet::new(),
            rooms: DashMap::new(),
            remote_rooms: DashMap::new(),
            listener,
        }
    }

    /// Namespace name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Application listener, if any
    pub fn listener(&self) -> Option<&Arc<dyn NamespaceListener>> {
        self.listener.as_ref()
    }

    /// Add a member; returns whether it was new
    pub fn join(&self, sid: SessionId) -> bool {
        self.members.insert(sid)
    }

    /// Remove a member and drop it from every room
    pub fn leave(&self, sid: SessionId) -> bool {
        let removed = self.members.remove(&sid).is_some();
        self.rooms.retain(|_, members| {
            members.remove(&sid);
            !members.is_empty()
        });
        removed
    }

    /// Whether `sid` is a member
    pub fn contains(&self, sid: SessionId) -> bool {
        self.members.contains(&sid)
    }

    /// Add a member to `room`. Non-members are refused.
    pub fn join_room(&self, room: &str, sid: SessionId) -> bool {
        if !self.contains(sid) {
            return false;
        }
        self.rooms.entry(room.to_string()).or_default().insert(sid)
    }

    /// Remove a member from `room`
    pub fn leave_room(&self, room: &str, sid: SessionId) -> bool {
        let removed = self
            .rooms
            .get(room)
            .map(|members| members.remove(&sid).is_some())
            .unwrap_or(false);
        self.rooms.remove_if(room, |_, members| members.is_empty());
        removed
    }

    /// Snapshot of the members
    pub fn members(&self) -> Vec<SessionId> {
        self.members.iter().map(|sid| *sid).collect()
    }

    /// Snapshot of a room's members on every node
    pub fn room_members(&self, room: &str) -> Vec<SessionId> {
        let mut members = self.local_room_members(room);
        if let Some(remote) = self.remote_rooms.get(room) {
            members.extend(remote.iter().map(|sid| *sid));
        }
        members
    }

    /// Snapshot of a room's members on this node
    pub fn local_room_members(&self, room: &str) -> Vec<SessionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().map(|sid| *sid).collect())
            .unwrap_or_default()
    }

    /// Record a session of another node joining `room`
    pub fn join_remote_room(&self, room: &str, sid: SessionId) -> bool {
        self.remote_rooms.entry(room.to_string()).or_default().insert(sid)
    }

    /// Record a session of another node leaving `room`
    pub fn leave_remote_room(&self, room: &str, sid: SessionId) -> bool {
        let removed = self
            .remote_rooms
            .get(room)
            .map(|members| members.remove(&sid).is_some())
            .unwrap_or(false);
        self.remote_rooms.remove_if(room, |_, members| members.is_empty());
        removed
    }

    /// Drop a session of another node from every room
    pub fn forget_remote(&self, sid: SessionId) {
        self.remote_rooms.retain(|_, members| {
            members.remove(&sid);
            !members.is_empty()
        });
    }
}

/// All namespaces of a server. The root namespace always exists.
pub struct NamespaceRegistry {
    namespaces: DashMap<String, Arc<Namespace>>,
}

impl NamespaceRegistry {
    /// Registry holding only the root namespace
    pub fn new() -> Self {
        let namespaces = DashMap::new();
        namespaces.insert(
            ROOT_NAMESPACE.to_string(),
            Arc::new(Namespace::new(ROOT_NAMESPACE.to_string(), None)),
        );
        Self { namespaces }
    }

    /// Register (or replace) a namespace
    pub fn register(
        &self,
        name: impl Into<String>,
        listener: Option<Arc<dyn NamespaceListener>>,
    ) -> Arc<Namespace> {
        let name = name.into();
        let namespace = Arc::new(Namespace::new(name.clone(), listener));
        self.namespaces.insert(name.clone(), namespace.clone());
        debug!(nsp = %name, "namespace registered");
        namespace
    }

    /// Namespace by name
    pub fn get(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.get(name).map(|ns| ns.value().clone())
    }

    /// Join `sid` to a registered namespace
    pub fn join(&self, name: &str, sid: SessionId) -> Option<Arc<Namespace>> {
        let namespace = self.get(name)?;
        namespace.join(sid);
        Some(namespace)
    }

    /// Add `sid` to a room of a namespace it has joined
    pub fn join_room(&self, name: &str, room: &str, sid: SessionId) -> bool {
        self.get(name).map(|ns| ns.join_room(room, sid)).unwrap_or(false)
    }

    /// Remove `sid` from a room
    pub fn leave_room(&self, name: &str, room: &str, sid: SessionId) -> bool {
        self.get(name).map(|ns| ns.leave_room(room, sid)).unwrap_or(false)
    }

    /// Registered namespace names
    pub fn names(&self) -> Vec<String> {
        self.namespaces.iter().map(|ns| ns.key().clone()).collect()
    }
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_always_exists() {
        let registry = NamespaceRegistry::new();
        assert!(registry.get("").is_some());
        assert!(registry.get("/missing").is_none());
    }

    #[test]
    fn test_rooms_follow_membership() {
        let registry = NamespaceRegistry::new();
        registry.register("/chat", None);
        let a = SessionId::new();
        let b = SessionId::new();

        assert!(!registry.join_room("/chat", "lobby", a));
        registry.join("/chat", a).unwrap();
        registry.join("/chat", b).unwrap();
        assert!(registry.join_room("/chat", "lobby", a));
        assert!(registry.join_room("/chat", "lobby", b));

        let chat = registry.get("/chat").unwrap();
        let mut members = chat.room_members("lobby");
        members.sort_by_key(|sid| sid.to_string());
        let mut expected = vec![a, b];
        expected.sort_by_key(|sid| sid.to_string());
        assert_eq!(members, expected);

        assert!(chat.leave(a));
        assert!(!chat.contains(a));
        assert_eq!(chat.room_members("lobby"), vec![b]);
        assert!(registry.leave_room("/chat", "lobby", b));
        assert!(chat.room_members("lobby").is_empty());
    }

    #[test]
    fn test_remote_room_members_kept_apart() {
        let registry = NamespaceRegistry::new();
        let chat = registry.register("/chat", None);
        let local = SessionId::new();
        let remote = SessionId::new();
        chat.join(local);
        chat.join_room("lobby", local);

        assert!(chat.join_remote_room("lobby", remote));
        assert!(!chat.join_remote_room("lobby", remote));
        assert!(chat.join_remote_room("games", remote));
        assert_eq!(chat.room_members("lobby").len(), 2);
        assert_eq!(chat.local_room_members("lobby"), vec![local]);
        assert!(!chat.contains(remote));

        assert!(chat.leave_remote_room("lobby", remote));
        assert_eq!(chat.room_members("lobby"), vec![local]);
        chat.forget_remote(remote);
        assert!(chat.room_members("games").is_empty());
    }
}
