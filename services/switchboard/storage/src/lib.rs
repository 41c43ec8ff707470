//! Session scratch storage and cluster pub/sub for switchboard.
//!
//! This crate provides the two external collaborators the protocol engine
//! talks to: a per-session key/value store whose lifecycle follows the
//! session, and a publish/subscribe fan-out used to mirror connect,
//! disconnect, room membership and broadcast events across server nodes.
//! Backends are pluggable (in-memory, Redis).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Server node identifier, generated once at startup
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Store or subscription already torn down
    #[error("Closed")]
    Closed,
}

/// Per-session key/value scratch space
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a value under `key`
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Value under `key`, if any
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Whether `key` is set
    async fn has(&self, key: &str) -> Result<bool, StorageError>;

    /// Remove `key`
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Creates and destroys session stores, one per session
#[async_trait]
pub trait StoreFactory: Send + Sync {
    /// Store for a new session
    async fn create(&self, session_id: &str) -> Result<Arc<dyn SessionStore>, StorageError>;

    /// Drop the session's store and everything in it
    async fn destroy(&self, session_id: &str) -> Result<(), StorageError>;
}

/// Kind of cluster event
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    /// Session connected to a namespace
    Connect,
    /// Session disconnected
    Disconnect,
    /// Session joined a room
    Join,
    /// Session left a room
    Leave,
    /// Packet broadcast to a namespace or room
    Dispatch,
}

impl ClusterKind {
    /// Topic this kind is published on
    pub fn topic(self) -> &'static str {
        match self {
            ClusterKind::Connect => "connect",
            ClusterKind::Disconnect => "disconnect",
            ClusterKind::Join => "join",
            ClusterKind::Leave => "leave",
            ClusterKind::Dispatch => "dispatch",
        }
    }

    /// Every kind, in topic order
    pub fn all() -> [ClusterKind; 5] {
        [
            ClusterKind::Connect,
            ClusterKind::Disconnect,
            ClusterKind::Join,
            ClusterKind::Leave,
            ClusterKind::Dispatch,
        ]
    }
}

/// One encoded frame carried by a dispatch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFrame {
    /// Whether the frame is binary
    pub binary: bool,
    /// Frame bytes
    pub data: Bytes,
}

/// Message exchanged between nodes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterMessage {
    /// Originating node
    pub node_id: NodeId,
    /// Event kind
    pub kind: ClusterKind,
    /// Namespace the event applies to
    pub namespace: String,
    /// Room, for room-scoped events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Session, for membership events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Encoded packet frames, for dispatch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<ClusterFrame>,
}

impl ClusterMessage {
    /// Message with no room, session or frames
    pub fn new(node_id: NodeId, kind: ClusterKind, namespace: impl Into<String>) -> Self {
        Self {
            node_id,
            kind,
            namespace: namespace.into(),
            room: None,
            session_id: None,
            frames: Vec::new(),
        }
    }

    /// Set the session
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the room
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Set the dispatched frames
    pub fn with_frames(mut self, frames: Vec<ClusterFrame>) -> Self {
        self.frames = frames;
        self
    }

    /// Serialize for a wire backend
    pub fn to_json(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a wire backend
    pub fn from_json(text: &str) -> Result<Self, StorageError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Receiver of cluster messages from other nodes
pub trait ClusterListener: Send + Sync {
    /// Handle one message. Messages from the local node never arrive here.
    fn on_message(&self, message: ClusterMessage);
}

/// Cluster publish/subscribe backend
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish to every subscriber of `topic` on other nodes
    async fn publish(&self, topic: &str, message: ClusterMessage) -> Result<(), StorageError>;

    /// Deliver messages on `topic` to `listener`, replacing any previous
    /// subscription of this node
    async fn subscribe(&self, topic: &str, listener: Arc<dyn ClusterListener>) -> Result<(), StorageError>;

    /// Stop delivering `topic`
    async fn unsubscribe(&self, topic: &str) -> Result<(), StorageError>;
}

/// Pub/sub backend configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PubSubMode {
    /// In-process only (single node, tests)
    #[default]
    Memory,
    /// Redis PUBLISH/SUBSCRIBE
    Redis {
        /// Redis connection URL
        url: String,
    },
}

// Re-export backend implementations
pub use backend::mem::{MemoryHub, MemoryPubSub, MemoryStore, MemoryStoreFactory};

#[cfg(feature = "redis-backend")]
pub use backend::redis::RedisPubSub;

/// Combined storage collaborators
#[derive(Clone)]
pub struct Storage {
    /// Cluster fan-out
    pub pubsub: Arc<dyn PubSub>,
    /// Session store lifecycle
    pub stores: Arc<dyn StoreFactory>,
}

impl Storage {
    /// In-memory storage on a private hub
    pub fn in_memory(node_id: NodeId) -> Self {
        Storage {
            pubsub: Arc::new(MemoryPubSub::new(MemoryHub::new(), node_id)),
            stores: Arc::new(MemoryStoreFactory::new()),
        }
    }

    /// Create storage from configuration
    pub async fn from_mode(mode: PubSubMode, node_id: NodeId) -> Result<Self, StorageError> {
        match mode {
            PubSubMode::Memory => Ok(Self::in_memory(node_id)),
            #[cfg(feature = "redis-backend")]
            PubSubMode::Redis { url } => Ok(Storage {
                pubsub: Arc::new(RedisPubSub::connect(&url, node_id).await?),
                stores: Arc::new(MemoryStoreFactory::new()),
            }),
            #[cfg(not(feature = "redis-backend"))]
            PubSubMode::Redis { .. } => Err(StorageError::Backend(
                "redis pub/sub requires the redis-backend feature".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_message_json() {
        let message = ClusterMessage::new(NodeId(7), ClusterKind::Join, "/chat")
            .with_session("abc")
            .with_room("lobby");
        let text = message.to_json().unwrap();
        assert!(text.contains(r#""kind":"join""#));
        assert!(!text.contains("frames"));
        assert_eq!(ClusterMessage::from_json(&text).unwrap(), message);
    }

    #[test]
    fn test_pubsub_mode_yaml_shape() {
        let mode: PubSubMode = serde_json::from_str(r#"{"mode":"redis","url":"redis://x"}"#).unwrap();
        assert_eq!(
            mode,
            PubSubMode::Redis {
                url: "redis://x".to_string()
            }
        );
        let mode: PubSubMode = serde_json::from_str(r#"{"mode":"memory"}"#).unwrap();
        assert_eq!(mode, PubSubMode::Memory);
    }

    #[cfg(not(feature = "redis-backend"))]
    #[tokio::test]
    async fn test_redis_mode_needs_feature() {
        let result = Storage::from_mode(
            PubSubMode::Redis {
                url: "redis://localhost".to_string(),
            },
            NodeId(1),
        )
        .await;
        assert!(matches!(result, Err(StorageError::Backend(_))));
    }
}
