//! Schema cache
//!
//! Remembers the pair (declared metadata hash, live schema checksum) seen
//! after the last successful sync. When both still match, the detector's
//! diff can be skipped. The cache is advisory: every failure surfaces as
//! [`MigrationError::Cache`] and callers log and carry on.

pub mod file;
pub mod redis;

use crate::config::{CacheBackend, CacheSettings};
use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub use self::redis::RedisSchemaCache;
pub use file::FileSchemaCache;

/// A recorded in-sync state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub declared_hash: String,
    pub live_checksum: String,
    pub synced_at: DateTime<Utc>,
}

#[async_trait]
pub trait SchemaCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()>;

    async fn invalidate(&self, key: &str) -> Result<()>;
}

pub struct SchemaCacheManager {
    cache: Arc<dyn SchemaCache>,
    key: String,
}

impl SchemaCacheManager {
    pub fn new(cache: Arc<dyn SchemaCache>, key: impl Into<String>) -> Self {
        Self {
            cache,
            key: key.into(),
        }
    }

    /// Build the configured cache; `None` when caching is disabled
    pub fn from_settings(settings: &CacheSettings, key: impl Into<String>) -> Result<Option<Self>> {
        let cache: Arc<dyn SchemaCache> = match settings.backend {
            CacheBackend::None => return Ok(None),
            CacheBackend::File => Arc::new(FileSchemaCache::new(&settings.path)),
            CacheBackend::Redis => {
                let url = settings.redis_url.as_deref().ok_or_else(|| {
                    MigrationError::Cache("redis cache selected without a REDIS_URL".to_string())
                })?;
                Arc::new(RedisSchemaCache::new(url, &settings.key_prefix, settings.ttl)?)
            }
        };
        Ok(Some(Self::new(cache, key)))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the declaration and the live schema are both unchanged since
    /// the last recorded sync
    pub async fn is_synchronised(&self, declared_hash: &str, live_checksum: &str) -> Result<bool> {
        let hit = match self.cache.get(&self.key).await? {
            Some(entry) => {
                entry.declared_hash == declared_hash && entry.live_checksum == live_checksum
            }
            None => false,
        };
        debug!("Schema cache {} for '{}'", if hit { "hit" } else { "miss" }, self.key);
        Ok(hit)
    }

    /// Remember the state observed after a successful sync
    pub async fn record(&self, declared_hash: &str, live_checksum: &str) -> Result<()> {
        let entry = CacheEntry {
            declared_hash: declared_hash.to_string(),
            live_checksum: live_checksum.to_string(),
            synced_at: Utc::now(),
        };
        self.cache.set(&self.key, &entry).await
    }

    pub async fn invalidate(&self) -> Result<()> {
        self.cache.invalidate(&self.key).await
    }
}
