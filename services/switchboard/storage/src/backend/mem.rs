//! In-memory storage backend for single-node deployments and testing

use crate::{ClusterListener, ClusterMessage, NodeId, PubSub, SessionStore, StorageError, StoreFactory};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// In-memory session store
#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, Value>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.values.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.values.remove(key);
        Ok(())
    }
}

/// Factory handing out one [`MemoryStore`] per session
#[derive(Default)]
pub struct MemoryStoreFactory {
    stores: DashMap<String, Arc<MemoryStore>>,
}

impl MemoryStoreFactory {
    /// Create a new factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live stores
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Whether no store is live
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    async fn create(&self, session_id: &str) -> Result<Arc<dyn SessionStore>, StorageError> {
        let store = self
            .stores
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone();
        Ok(store)
    }

    async fn destroy(&self, session_id: &str) -> Result<(), StorageError> {
        if self.stores.remove(session_id).is_some() {
            debug!(sid = %session_id, "session store destroyed");
        }
        Ok(())
    }
}

/// Shared in-process bus. Every [`MemoryPubSub`] created on the same hub
/// sees the others' messages.
#[derive(Default)]
pub struct MemoryHub {
    topics: DashMap<String, Vec<(NodeId, Arc<dyn ClusterListener>)>>,
}

impl MemoryHub {
    /// Create a new hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// In-process pub/sub node attached to a [`MemoryHub`]
pub struct MemoryPubSub {
    hub: Arc<MemoryHub>,
    node_id: NodeId,
}

impl MemoryPubSub {
    /// Attach node `node_id` to `hub`
    pub fn new(hub: Arc<MemoryHub>, node_id: NodeId) -> Self {
        Self { hub, node_id }
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, message: ClusterMessage) -> Result<(), StorageError> {
        // round-trip through json so delivery matches a wire backend
        let text = message.to_json()?;

        let listeners: Vec<(NodeId, Arc<dyn ClusterListener>)> = match self.hub.topics.get(topic) {
            Some(subs) => subs.value().clone(),
            None => return Ok(()),
        };

        for (node_id, listener) in listeners {
            let message = ClusterMessage::from_json(&text)?;
            if message.node_id == node_id {
                continue;
            }
            listener.on_message(message);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, listener: Arc<dyn ClusterListener>) -> Result<(), StorageError> {
        let mut subs = self.hub.topics.entry(topic.to_string()).or_default();
        subs.retain(|(node_id, _)| *node_id != self.node_id);
        subs.push((self.node_id, listener));
        debug!(node = %self.node_id, topic, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), StorageError> {
        if let Some(mut subs) = self.hub.topics.get_mut(topic) {
            subs.retain(|(node_id, _)| *node_id != self.node_id);
        }
        Ok(())
    }
}
