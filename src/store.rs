// =============================================================================
// Latest-Value Store — one JSON document per topic, overwritten on each write
// =============================================================================
//
// This is not a queue: a reader only ever sees the most recent value, so
// intermediate bar updates written between two polls are lost.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::error::StoreError;

#[async_trait]
pub trait LatestValueStore: Send + Sync {
    async fn get(&self, topic: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, topic: &str, value: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

/// Redis-backed store using plain `GET` / `SET` on the topic key.
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = %url, "connected to redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl LatestValueStore for RedisStore {
    async fn get(&self, topic: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(topic).await?;
        Ok(value)
    }

    async fn set(&self, topic: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(topic, value).await?;
        debug!(topic, bytes = value.len(), "store value replaced");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// In-process store for the standalone role.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LatestValueStore for MemoryStore {
    async fn get(&self, topic: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().get(topic).cloned())
    }

    async fn set(&self, topic: &str, value: &str) -> Result<(), StoreError> {
        self.values.write().insert(topic.to_string(), value.to_string());
        Ok(())
    }
}
