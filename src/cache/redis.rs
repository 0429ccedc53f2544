//! Redis schema cache
//!
//! Pooled through deadpool-redis. Entries are JSON values written with
//! `SET EX` so a stale entry expires on its own.

use super::{CacheEntry, SchemaCache};
use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;

#[derive(Clone)]
pub struct RedisSchemaCache {
    pool: Pool,
    key_prefix: String,
    ttl: Duration,
}

impl RedisSchemaCache {
    pub fn new(url: &str, key_prefix: &str, ttl: Duration) -> Result<Self> {
        let pool = PoolConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| MigrationError::Cache(format!("Failed to create Redis pool: {}", e)))?;
        Ok(Self::from_pool(pool, key_prefix, ttl))
    }

    pub fn from_pool(pool: Pool, key_prefix: &str, ttl: Duration) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.to_string(),
            ttl,
        }
    }

    fn build_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrationError::Cache(format!("Failed to get Redis connection: {}", e)))
    }
}

fn redis_error(op: &str, err: redis::RedisError) -> MigrationError {
    MigrationError::Cache(format!("Redis {} failed: {}", op, err))
}

#[async_trait]
impl SchemaCache for RedisSchemaCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn
            .get(self.build_key(key))
            .await
            .map_err(|e| redis_error("GET", e))?;

        value
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| MigrationError::Cache(format!("corrupt cache entry: {}", e)))
            })
            .transpose()
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let body = serde_json::to_vec(entry).map_err(|e| MigrationError::Cache(e.to_string()))?;
        let mut conn = self.conn().await?;
        // SET EX rejects a zero expiry
        let seconds = self.ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(self.build_key(key), body, seconds)
            .await
            .map_err(|e| redis_error("SET", e))?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .del(self.build_key(key))
            .await
            .map_err(|e| redis_error("DEL", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keys_are_prefixed() {
        let cache =
            RedisSchemaCache::new("redis://127.0.0.1:6379", "app:schema", Duration::from_secs(60))
                .unwrap();
        assert_eq!(cache.build_key("db"), "app:schema:db");

        let bare = RedisSchemaCache::from_pool(cache.pool.clone(), "", Duration::from_secs(60));
        assert_eq!(bare.build_key("db"), "db");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_cache_error() {
        let cache =
            RedisSchemaCache::new("redis://127.0.0.1:1", "app:schema", Duration::from_secs(60))
                .unwrap();
        let err = cache.get("db").await.unwrap_err();
        assert!(matches!(err, MigrationError::Cache(_)));
    }
}
