//! JSON file schema cache

use super::{CacheEntry, SchemaCache};
use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// All entries live in one JSON object keyed by cache key
pub struct FileSchemaCache {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSchemaCache {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, CacheEntry>> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| self.error(e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(self.error(e)),
        }
    }

    async fn store(&self, entries: &BTreeMap<String, CacheEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.error(e))?;
        }
        let body = serde_json::to_vec_pretty(entries).map_err(|e| self.error(e))?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| self.error(e))
    }

    fn error(&self, err: impl std::fmt::Display) -> MigrationError {
        MigrationError::Cache(format!("{}: {}", self.path.display(), err))
    }
}

#[async_trait]
impl SchemaCache for FileSchemaCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(key.to_string(), entry.clone());
        self.store(&entries).await
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        if entries.remove(key).is_some() {
            self.store(&entries).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(hash: &str) -> CacheEntry {
        CacheEntry {
            declared_hash: hash.to_string(),
            live_checksum: "live".to_string(),
            synced_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_entries_are_keyed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSchemaCache::new(&dir.path().join("nested").join("cache.json"));

        cache.set("a", &entry("1")).await.unwrap();
        cache.set("b", &entry("2")).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap().unwrap().declared_hash, "1");
        assert_eq!(cache.get("b").await.unwrap().unwrap().declared_hash, "2");

        cache.invalidate("a").await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_cache_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileSchemaCache::new(&path).get("a").await.unwrap_err();
        assert!(matches!(err, MigrationError::Cache(_)));
    }
}
