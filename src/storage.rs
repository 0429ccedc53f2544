//! Migration history storage
//!
//! One row per applied migration in the history table, carrying the SQL that
//! undoes it. Rows are never cached client-side; every read goes to the
//! database.

use crate::db::Database;
use crate::error::{MigrationError, Result};
use crate::schema::validate_identifier;
use crate::types::{OperationResult, RiskLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound used when every row is wanted
const ALL_ROWS: usize = i64::MAX as usize;

/// A row of the history table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub version: String,
    pub description: String,
    pub rollback_sql: String,
    pub risk_level: String,
    pub executed_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn risk(&self) -> Option<RiskLevel> {
        self.risk_level.parse().ok()
    }
}

pub struct MigrationStorage {
    db: Arc<dyn Database>,
    table: String,
}

impl MigrationStorage {
    pub fn new(db: Arc<dyn Database>, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { db, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the history table if it does not exist
    pub async fn initialize(&self) -> Result<()> {
        self.db
            .create_history_table(&self.table)
            .await
            .map_err(MigrationError::storage)?;
        debug!("History table '{}' ready", self.table);
        Ok(())
    }

    /// Record an applied migration
    ///
    /// Recording a version twice succeeds with `idempotent` set. When the
    /// stored row carries a different description or rollback SQL the stored
    /// row is kept and `content_mismatch` is flagged.
    pub async fn record_migration(
        &self,
        version: &str,
        description: &str,
        rollback_sql: &str,
        risk_level: RiskLevel,
    ) -> Result<OperationResult> {
        let record = MigrationRecord {
            version: version.to_string(),
            description: description.to_string(),
            rollback_sql: rollback_sql.to_string(),
            risk_level: risk_level.as_str().to_string(),
            executed_at: Utc::now(),
        };

        let inserted = self
            .db
            .insert_history(&self.table, &record)
            .await
            .map_err(MigrationError::storage)?;

        if inserted {
            debug!("Recorded migration {}", version);
            return Ok(OperationResult::ok(format!("Recorded migration {}", version))
                .with_meta("version", version));
        }

        let mut result = OperationResult::ok(format!("Migration {} already recorded", version))
            .with_meta("version", version)
            .with_meta("idempotent", true);

        if let Some(existing) = self.get_migration(version).await? {
            if existing.description != record.description
                || existing.rollback_sql != record.rollback_sql
            {
                warn!(
                    "Migration {} re-recorded with different content; keeping the stored row",
                    version
                );
                result = result.with_meta("content_mismatch", true);
            }
        }
        Ok(result)
    }

    /// Newest-first history
    pub async fn get_migration_history(&self, limit: usize) -> Result<Vec<MigrationRecord>> {
        self.db
            .fetch_history(&self.table, limit)
            .await
            .map_err(MigrationError::storage)
    }

    pub async fn get_migration(&self, version: &str) -> Result<Option<MigrationRecord>> {
        self.db
            .find_history(&self.table, version)
            .await
            .map_err(MigrationError::storage)
    }

    /// Remove a row; `false` when the version was not recorded
    pub async fn delete_migration(&self, version: &str) -> Result<bool> {
        let deleted = self
            .db
            .delete_history(&self.table, version)
            .await
            .map_err(MigrationError::storage)?;
        Ok(deleted > 0)
    }

    /// Keep only the newest `keep_latest` rows; returns how many were removed
    pub async fn cleanup(&self, keep_latest: usize) -> Result<usize> {
        let rows = self.get_migration_history(ALL_ROWS).await?;
        let mut removed = 0;
        for record in rows.iter().skip(keep_latest) {
            if self.delete_migration(&record.version).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("🧹 Removed {} old history row(s) from '{}'", removed, self.table);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;

    async fn storage() -> MigrationStorage {
        let db: Arc<dyn Database> = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let storage = MigrationStorage::new(db, "_history").unwrap();
        storage.initialize().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_rejects_invalid_table_name() {
        let db: Arc<dyn Database> = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        assert!(MigrationStorage::new(db, "bad; DROP TABLE x").is_err());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let storage = storage().await;
        storage.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_record_twice_is_idempotent() {
        let storage = storage().await;

        let first = storage
            .record_migration("v1", "create users", "DROP TABLE users", RiskLevel::Safe)
            .await
            .unwrap();
        assert!(first.success);
        assert!(!first.flag("idempotent"));

        let second = storage
            .record_migration("v1", "create users", "DROP TABLE users", RiskLevel::Safe)
            .await
            .unwrap();
        assert!(second.success);
        assert!(second.flag("idempotent"));
        assert!(!second.flag("content_mismatch"));

        assert_eq!(storage.get_migration_history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rerecord_with_different_content_is_flagged() {
        let storage = storage().await;
        storage
            .record_migration("v1", "create users", "DROP TABLE users", RiskLevel::Safe)
            .await
            .unwrap();

        let result = storage
            .record_migration("v1", "create people", "DROP TABLE people", RiskLevel::Safe)
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.flag("content_mismatch"));

        let stored = storage.get_migration("v1").await.unwrap().unwrap();
        assert_eq!(stored.description, "create users");
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_cleanup_keeps_latest() {
        let storage = storage().await;
        for v in ["v1", "v2", "v3", "v4"] {
            storage
                .record_migration(v, v, "", RiskLevel::Medium)
                .await
                .unwrap();
        }

        let history = storage.get_migration_history(2).await.unwrap();
        let versions: Vec<_> = history.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["v4", "v3"]);
        assert_eq!(history[0].risk(), Some(RiskLevel::Medium));

        assert_eq!(storage.cleanup(1).await.unwrap(), 3);
        let remaining = storage.get_migration_history(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].version, "v4");
    }

    #[tokio::test]
    async fn test_delete_missing_version() {
        let storage = storage().await;
        assert!(!storage.delete_migration("nope").await.unwrap());
        assert!(storage.get_migration("nope").await.unwrap().is_none());
    }
}
