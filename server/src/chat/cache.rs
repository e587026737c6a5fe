//! Keyed ephemeral cache for messages awaiting persistence.
//!
//! The backend is pluggable; the default is an in-process moka cache
//! with a per-entry TTL, which is also the fallback when no external
//! keyed store is deployed. Cache failures are never fatal to the chat
//! pipeline.

use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;
use uuid::Uuid;

use crate::config::CACHE_TTL;
use crate::error::WsResult;

/// Cache key for a message awaiting persistence.
pub fn message_key(message_id: Uuid) -> String {
    format!("msg:{message_id}")
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn save(&self, key: &str, value: String) -> WsResult<()>;

    async fn get(&self, key: &str) -> WsResult<Option<String>>;

    async fn delete(&self, key: &str) -> WsResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// In-memory backend with TTL eviction.
pub struct MokaBackend {
    cache: Cache<String, String>,
}

impl MokaBackend {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).build(),
        }
    }
}

impl Default for MokaBackend {
    fn default() -> Self {
        Self::new(CACHE_TTL)
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    async fn save(&self, key: &str, value: String) -> WsResult<()> {
        self.cache.insert(key.to_string(), value).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> WsResult<Option<String>> {
        Ok(self.cache.get(key).await)
    }

    async fn delete(&self, key: &str) -> WsResult<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "moka"
    }
}
