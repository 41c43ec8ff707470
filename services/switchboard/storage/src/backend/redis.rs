//! Redis pub/sub backend

use crate::{ClusterListener, ClusterMessage, NodeId, PubSub, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CHANNEL_PREFIX: &str = "switchboard:";

/// Cluster pub/sub over Redis PUBLISH/SUBSCRIBE.
///
/// Each subscribed topic gets its own subscriber connection and reader task.
pub struct RedisPubSub {
    client: Client,
    publisher: ConnectionManager,
    node_id: NodeId,
    readers: DashMap<String, JoinHandle<()>>,
}

impl RedisPubSub {
    /// Connect to `url` as node `node_id`
    pub async fn connect(url: &str, node_id: NodeId) -> Result<Self, StorageError> {
        let client = Client::open(url).map_err(backend)?;
        let publisher = ConnectionManager::new(client.clone()).await.map_err(backend)?;
        debug!(node = %node_id, "redis pub/sub connected");
        Ok(Self {
            client,
            publisher,
            node_id,
            readers: DashMap::new(),
        })
    }
}

fn backend(err: redis::RedisError) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn channel(topic: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, topic)
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, topic: &str, message: ClusterMessage) -> Result<(), StorageError> {
        let payload = message.to_json()?;
        let mut conn = self.publisher.clone();
        redis::cmd("PUBLISH")
            .arg(channel(topic))
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, listener: Arc<dyn ClusterListener>) -> Result<(), StorageError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend)?;
        pubsub.subscribe(channel(topic)).await.map_err(backend)?;

        let node_id = self.node_id;
        let name = topic.to_string();
        let reader = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(topic = %name, error = %e, "unreadable pub/sub payload");
                        continue;
                    }
                };
                match ClusterMessage::from_json(&payload) {
                    Ok(message) if message.node_id == node_id => {}
                    Ok(message) => listener.on_message(message),
                    Err(e) => warn!(topic = %name, error = %e, "malformed cluster message"),
                }
            }
            debug!(topic = %name, "redis subscription ended");
        });

        if let Some(previous) = self.readers.insert(topic.to_string(), reader) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), StorageError> {
        if let Some((_, reader)) = self.readers.remove(topic) {
            reader.abort();
        }
        Ok(())
    }
}

impl Drop for RedisPubSub {
    fn drop(&mut self) {
        for reader in self.readers.iter() {
            reader.value().abort();
        }
    }
}
