//! Migration checkpoints
//!
//! One JSON file per migration attempt in a checkpoint directory, so that a
//! run interrupted mid-way can tell which changes were started but never
//! finished.

use crate::error::{MigrationError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckpointStatus::Completed | CheckpointStatus::Failed)
    }

    fn can_become(&self, next: CheckpointStatus) -> bool {
        use CheckpointStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, Pending)
                | (Failed, InProgress)
        )
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub version: String,
    pub migration_id: String,
    pub status: CheckpointStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Percent complete, 0..=100
    pub progress: u8,
}

pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, migration_id: &str) -> Result<PathBuf> {
        let valid = !migration_id.is_empty()
            && migration_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !migration_id.starts_with('.');
        if !valid {
            return Err(MigrationError::Checkpoint(format!(
                "invalid migration id '{}'",
                migration_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", migration_id)))
    }

    async fn write(&self, record: &CheckpointRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;

        let path = self.path_for(&record.migration_id)?;
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| MigrationError::Checkpoint(e.to_string()))?;

        // write-then-rename so a crash never leaves half a record
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    pub async fn get(&self, migration_id: &str) -> Result<Option<CheckpointRecord>> {
        let path = self.path_for(migration_id)?;
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| MigrationError::Checkpoint(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn transition(
        &self,
        version: &str,
        migration_id: &str,
        next: CheckpointStatus,
        error: Option<String>,
    ) -> Result<CheckpointRecord> {
        let now = Utc::now();
        let mut record = match self.get(migration_id).await? {
            Some(existing) => {
                if !existing.status.can_become(next) {
                    return Err(MigrationError::Checkpoint(format!(
                        "migration '{}' cannot move from {} to {}",
                        migration_id, existing.status, next
                    )));
                }
                existing
            }
            None if next.is_terminal() => {
                return Err(MigrationError::Checkpoint(format!(
                    "migration '{}' was never started, cannot mark it {}",
                    migration_id, next
                )));
            }
            None => CheckpointRecord {
                version: version.to_string(),
                migration_id: migration_id.to_string(),
                status: next,
                started_at: now,
                completed_at: None,
                error: None,
                progress: 0,
            },
        };

        if record.status == CheckpointStatus::Failed && !next.is_terminal() {
            // retry of a failed attempt
            record.started_at = now;
            record.progress = 0;
            record.error = None;
        }

        record.status = next;
        record.completed_at = next.is_terminal().then_some(now);
        if next == CheckpointStatus::Completed {
            record.progress = 100;
        }
        if error.is_some() {
            record.error = error;
        }

        self.write(&record).await?;
        debug!("Checkpoint {} -> {}", migration_id, next);
        Ok(record)
    }

    pub async fn mark_pending(&self, version: &str, migration_id: &str) -> Result<CheckpointRecord> {
        self.transition(version, migration_id, CheckpointStatus::Pending, None)
            .await
    }

    pub async fn mark_in_progress(
        &self,
        version: &str,
        migration_id: &str,
    ) -> Result<CheckpointRecord> {
        self.transition(version, migration_id, CheckpointStatus::InProgress, None)
            .await
    }

    pub async fn mark_completed(
        &self,
        version: &str,
        migration_id: &str,
    ) -> Result<CheckpointRecord> {
        self.transition(version, migration_id, CheckpointStatus::Completed, None)
            .await
    }

    pub async fn mark_failed(
        &self,
        version: &str,
        migration_id: &str,
        error: &str,
    ) -> Result<CheckpointRecord> {
        self.transition(
            version,
            migration_id,
            CheckpointStatus::Failed,
            Some(error.to_string()),
        )
        .await
    }

    /// Set progress of a running migration, clamped to 100
    pub async fn update_progress(&self, migration_id: &str, progress: u32) -> Result<CheckpointRecord> {
        let mut record = self.get(migration_id).await?.ok_or_else(|| {
            MigrationError::Checkpoint(format!("no checkpoint for migration '{}'", migration_id))
        })?;
        if record.status != CheckpointStatus::InProgress {
            return Err(MigrationError::Checkpoint(format!(
                "migration '{}' is {}, progress can only be reported while in_progress",
                migration_id, record.status
            )));
        }
        record.progress = progress.min(100) as u8;
        self.write(&record).await?;
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<CheckpointRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir, e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&self.dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await.map_err(|e| io_error(&path, e))?;
            let record: CheckpointRecord = serde_json::from_slice(&raw)
                .map_err(|e| MigrationError::Checkpoint(format!("{}: {}", path.display(), e)))?;
            records.push(record);
        }
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }

    /// Attempts that never reached a terminal state
    pub async fn get_pending_migrations(&self) -> Result<Vec<CheckpointRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect())
    }

    pub async fn get_failed_migrations(&self) -> Result<Vec<CheckpointRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == CheckpointStatus::Failed)
            .collect())
    }

    /// Delete completed checkpoints older than `keep_days`
    pub async fn cleanup_completed(&self, keep_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(keep_days));
        let mut removed = 0;
        for record in self.list().await? {
            let expired = record.status == CheckpointStatus::Completed
                && record.completed_at.is_some_and(|at| at < cutoff);
            if expired {
                let path = self.path_for(&record.migration_id)?;
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| io_error(&path, e))?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("🧹 Removed {} completed checkpoint(s)", removed);
        }
        Ok(removed)
    }
}

fn io_error(path: &Path, err: std::io::Error) -> MigrationError {
    MigrationError::Checkpoint(format!("{}: {}", path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, CheckpointManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoints"));
        (dir, manager)
    }

    #[tokio::test]
    async fn test_lifecycle_to_completed() {
        let (_dir, cp) = manager();

        let pending = cp.mark_pending("v1", "m1").await.unwrap();
        assert_eq!(pending.status, CheckpointStatus::Pending);
        assert!(pending.completed_at.is_none());

        cp.mark_in_progress("v1", "m1").await.unwrap();
        let running = cp.update_progress("m1", 40).await.unwrap();
        assert_eq!(running.progress, 40);
        assert!(running.completed_at.is_none());

        let done = cp.mark_completed("v1", "m1").await.unwrap();
        assert_eq!(done.status, CheckpointStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());

        assert_eq!(cp.get("m1").await.unwrap().unwrap(), done);
    }

    #[tokio::test]
    async fn test_progress_is_clamped() {
        let (_dir, cp) = manager();
        cp.mark_in_progress("v1", "m1").await.unwrap();
        assert_eq!(cp.update_progress("m1", 250).await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let (_dir, cp) = manager();
        cp.mark_in_progress("v1", "m1").await.unwrap();
        cp.mark_completed("v1", "m1").await.unwrap();

        let err = cp.mark_in_progress("v1", "m1").await.unwrap_err();
        assert!(matches!(err, MigrationError::Checkpoint(_)));
        assert!(cp.update_progress("m1", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_pending_and_failed_queries() {
        let (_dir, cp) = manager();
        cp.mark_pending("v1", "m1").await.unwrap();
        cp.mark_in_progress("v2", "m2").await.unwrap();
        cp.mark_in_progress("v3", "m3").await.unwrap();
        cp.mark_failed("v3", "m3", "boom").await.unwrap();
        cp.mark_in_progress("v4", "m4").await.unwrap();
        cp.mark_completed("v4", "m4").await.unwrap();

        let pending: Vec<_> = cp
            .get_pending_migrations()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.migration_id)
            .collect();
        assert_eq!(pending.len(), 2);
        assert!(pending.contains(&"m1".to_string()));
        assert!(pending.contains(&"m2".to_string()));

        let failed = cp.get_failed_migrations().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_failed_attempt_can_be_retried() {
        let (_dir, cp) = manager();
        cp.mark_in_progress("v1", "m1").await.unwrap();
        cp.mark_failed("v1", "m1", "boom").await.unwrap();

        let retry = cp.mark_in_progress("v1", "m1").await.unwrap();
        assert_eq!(retry.status, CheckpointStatus::InProgress);
        assert!(retry.error.is_none());
        assert!(retry.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_completed_respects_age() {
        let (_dir, cp) = manager();
        cp.mark_in_progress("v1", "old").await.unwrap();
        let mut old = cp.mark_completed("v1", "old").await.unwrap();
        old.completed_at = Some(Utc::now() - ChronoDuration::days(10));
        cp.write(&old).await.unwrap();

        cp.mark_in_progress("v2", "fresh").await.unwrap();
        cp.mark_completed("v2", "fresh").await.unwrap();

        assert_eq!(cp.cleanup_completed(7).await.unwrap(), 1);
        assert!(cp.get("old").await.unwrap().is_none());
        assert!(cp.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let (_dir, cp) = manager();
        assert!(cp.mark_pending("v1", "../escape").await.is_err());
        assert!(cp.get("").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_dir_lists_nothing() {
        let (_dir, cp) = manager();
        assert!(cp.get_pending_migrations().await.unwrap().is_empty());
    }
}
