//! Migration engine
//!
//! Drives one `auto_migrate` run end to end: take the lock, detect drift,
//! assess risk, execute what the mode allows, record history, release the
//! lock. Also rolls back recorded migrations newest-first.
//!
//! DDL and the history insert are separate statements. A crash between them
//! leaves the change applied but unrecorded; the next run then detects no
//! drift for it and simply never records it.

use crate::cache::SchemaCacheManager;
use crate::checkpoint::CheckpointManager;
use crate::config::{Settings, DEFAULT_APP_NAME, DEFAULT_HISTORY_TABLE};
use crate::db::{split_statements, Database, Dialect};
use crate::detector::SchemaDetector;
use crate::error::{MigrationError, Result};
use crate::hooks::{find_veto, HookContext, HookOutcome, HookRegistry, HookTrigger};
use crate::lock::{select_lock, DistributedLock, MemoryLock};
use crate::rebuild;
use crate::risk::{AdvancedRiskAssessor, RiskRule, RiskSummary};
use crate::schema::SchemaMetadata;
use crate::storage::{MigrationRecord, MigrationStorage};
use crate::types::{
    Migration, MigrationMode, MigrationPlan, OperationResult, PlanStatus, RiskLevel,
    RollbackPolicy, SchemaChange,
};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Phases of a run, logged as the engine moves through them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    LockPending,
    Detecting,
    Assessing,
    Executing,
    Recording,
    Done,
    Skipped,
    Partial,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::LockPending => "lock_pending",
            RunState::Detecting => "detecting",
            RunState::Assessing => "assessing",
            RunState::Executing => "executing",
            RunState::Recording => "recording",
            RunState::Done => "done",
            RunState::Skipped => "skipped",
            RunState::Partial => "partial",
        };
        f.write_str(s)
    }
}

pub struct MigrationEngine {
    db: Arc<dyn Database>,
    metadata: SchemaMetadata,
    storage: MigrationStorage,
    assessor: AdvancedRiskAssessor,
    hooks: HookRegistry,
    lock: Arc<dyn DistributedLock>,
    lock_timeout: Duration,
    ignore_tables: Vec<String>,
    detection_timeout: Option<Duration>,
    rollback_policy: RollbackPolicy,
    checkpoints: Option<CheckpointManager>,
    cache: Option<SchemaCacheManager>,
}

impl MigrationEngine {
    /// Engine with the default history table and a process-local lock
    pub fn new(db: Arc<dyn Database>, metadata: SchemaMetadata) -> Result<Self> {
        let storage = MigrationStorage::new(db.clone(), DEFAULT_HISTORY_TABLE)?;
        let assessor = AdvancedRiskAssessor::new(db.dialect());
        Ok(Self {
            db,
            metadata,
            storage,
            assessor,
            hooks: HookRegistry::new(),
            lock: Arc::new(MemoryLock::new(&format!("{}_migration", DEFAULT_APP_NAME))),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            ignore_tables: Vec::new(),
            detection_timeout: None,
            rollback_policy: RollbackPolicy::default(),
            checkpoints: None,
            cache: None,
        })
    }

    /// Engine wired from loaded settings
    ///
    /// A schema cache that cannot be built is logged and left disabled.
    pub fn from_settings(
        db: Arc<dyn Database>,
        metadata: SchemaMetadata,
        settings: &Settings,
    ) -> Result<Self> {
        let lock = select_lock(&db, &settings.lock);
        let cache_key = format!("{}:{}", db.dialect(), settings.database.redacted_url());
        let cache = match SchemaCacheManager::from_settings(&settings.cache, cache_key) {
            Ok(cache) => cache,
            Err(e) => {
                warn!("Schema cache disabled: {}", e);
                None
            }
        };

        let mut engine = Self::new(db, metadata)?
            .with_history_table(&settings.migration.history_table)?
            .with_lock(lock, settings.lock.timeout)
            .with_detection_timeout(settings.migration.detection_timeout)
            .with_rollback_policy(settings.migration.rollback_policy)
            .ignore_tables(settings.migration.ignore_tables.iter().cloned());
        engine.cache = cache;
        if let Some(dir) = &settings.migration.checkpoint_dir {
            engine = engine.with_checkpoints(CheckpointManager::new(dir));
        }
        Ok(engine)
    }

    pub fn with_history_table(mut self, table: &str) -> Result<Self> {
        self.storage = MigrationStorage::new(self.db.clone(), table)?;
        Ok(self)
    }

    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>, timeout: Duration) -> Self {
        self.lock = lock;
        self.lock_timeout = timeout;
        self
    }

    pub fn with_detection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.detection_timeout = timeout;
        self
    }

    pub fn with_rollback_policy(mut self, policy: RollbackPolicy) -> Self {
        self.rollback_policy = policy;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: CheckpointManager) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_cache(mut self, cache: SchemaCacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Tables the engine never creates, alters or drops
    pub fn ignore_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_tables.extend(tables.into_iter().map(Into::into));
        self
    }

    pub fn add_risk_rule(&mut self, rule: impl RiskRule + 'static) {
        self.assessor.add_rule(rule);
    }

    pub fn register_migration_hook<F>(
        &mut self,
        name: impl Into<String>,
        trigger: HookTrigger,
        priority: i32,
        hook: F,
    ) where
        F: Fn(&HookContext) -> std::result::Result<HookOutcome, String> + Send + Sync + 'static,
    {
        self.hooks.register(name, trigger, priority, hook);
    }

    pub fn storage(&self) -> &MigrationStorage {
        &self.storage
    }

    pub fn lock(&self) -> &Arc<dyn DistributedLock> {
        &self.lock
    }

    pub fn checkpoints(&self) -> Option<&CheckpointManager> {
        self.checkpoints.as_ref()
    }

    fn detector(&self) -> SchemaDetector {
        SchemaDetector::new(self.db.clone(), self.metadata.clone())
            .ignore_table(self.storage.table())
            .ignore_tables(self.ignore_tables.iter().cloned())
            .with_timeout(self.detection_timeout)
    }

    fn transition(&self, run_id: Uuid, state: RunState) {
        debug!("Migration run {} -> {}", run_id, state);
    }

    // =========================================================================
    // AUTO MIGRATE
    // =========================================================================

    /// Bring the live schema in line with the declaration
    pub async fn auto_migrate(&self, mode: MigrationMode) -> Result<MigrationPlan> {
        self.run(mode, None).await
    }

    /// Same as [`auto_migrate`](Self::auto_migrate) with a caller-chosen
    /// version prefix; each migration becomes `{version}_{index:03}`
    pub async fn auto_migrate_versioned(
        &self,
        mode: MigrationMode,
        version: &str,
    ) -> Result<MigrationPlan> {
        if version.trim().is_empty() {
            return Err(MigrationError::Validation(
                "migration version must not be empty".to_string(),
            ));
        }
        self.run(mode, Some(version.trim())).await
    }

    async fn run(&self, mode: MigrationMode, base: Option<&str>) -> Result<MigrationPlan> {
        let mut plan = MigrationPlan::new(mode);
        self.transition(plan.run_id, RunState::LockPending);

        if !self.lock.acquire(self.lock_timeout).await? {
            info!(
                "⏭️ Lock '{}' is held elsewhere, skipping migration run",
                self.lock.name()
            );
            self.transition(plan.run_id, RunState::Skipped);
            plan.finish(PlanStatus::Skipped);
            return Ok(plan);
        }

        let outcome = self.run_locked(&mut plan, base).await;

        if let Err(e) = self.lock.release().await {
            warn!("Failed to release lock '{}': {}", self.lock.name(), e);
        }

        outcome.map(|()| plan)
    }

    async fn run_locked(&self, plan: &mut MigrationPlan, base: Option<&str>) -> Result<()> {
        self.storage.initialize().await?;

        self.transition(plan.run_id, RunState::Detecting);
        self.metadata.validate()?;
        let detector = self.detector();
        let live = detector.snapshot().await?;
        let declared_hash = self.metadata.content_hash();

        if self.cache_hit(&declared_hash, &live.checksum).await {
            info!("✅ Schema unchanged since last sync (cache hit)");
            self.transition(plan.run_id, RunState::Done);
            plan.finish(PlanStatus::UpToDate);
            return Ok(());
        }

        let mut changes = detector.diff(&live)?;
        if changes.is_empty() {
            info!("✅ Schema is up to date");
            self.cache_record(&declared_hash, &live.checksum).await;
            self.transition(plan.run_id, RunState::Done);
            plan.finish(PlanStatus::UpToDate);
            return Ok(());
        }

        self.transition(plan.run_id, RunState::Assessing);
        self.assessor.assess_all(&mut changes)?;

        self.transition(plan.run_id, RunState::Executing);
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        for (i, change) in changes.iter().enumerate() {
            let version = match base {
                Some(base) => format!("{}_{:03}", base, i + 1),
                None => format!("{}_{:03}_{}_{}", stamp, i + 1, change.change_type, change.table),
            };
            // assess_all has set every level
            let level = change.risk_level.unwrap_or(RiskLevel::High);
            let mut migration = Migration::from_change(version, change, level);

            if !plan.mode.allows(level) {
                migration.skip_reason =
                    Some(format!("risk level {} requires aggressive mode", level));
                debug!("Withheld {}: {}", migration.version, migration.description);
            } else {
                self.apply(plan.run_id, change, &mut migration).await;
            }
            plan.migrations.push(migration);
        }

        let status = plan.resolve_status();
        if status == PlanStatus::Completed {
            self.refresh_cache(&detector, &declared_hash).await;
        } else {
            self.cache_invalidate().await;
        }

        self.transition(
            plan.run_id,
            if status == PlanStatus::Completed {
                RunState::Done
            } else {
                RunState::Partial
            },
        );
        plan.finish(status);
        info!("🧠 {}", plan.summary());
        Ok(())
    }

    /// Execute and record one allowed change
    async fn apply(&self, run_id: Uuid, change: &SchemaChange, migration: &mut Migration) {
        let before = self.hooks.run(&hook_context(HookTrigger::BeforeDdl, migration, None));
        if let Some(veto) = find_veto(&before) {
            let reason = veto.veto_reason().unwrap_or_default();
            info!("Hook '{}' vetoed {}: {}", veto.hook, migration.version, reason);
            migration.skip_reason = Some(format!("vetoed by hook '{}': {}", veto.hook, reason));
            return;
        }

        self.checkpoint(migration, HookTrigger::BeforeDdl, None).await;
        let executed = self.execute_change(change, migration).await;
        let failure = executed.as_ref().err().map(ToString::to_string);

        self.hooks
            .run(&hook_context(HookTrigger::AfterDdl, migration, failure.clone()));
        self.checkpoint(migration, HookTrigger::AfterDdl, failure.as_deref())
            .await;

        if let Err(e) = executed {
            error!("❌ Migration {} failed: {}", migration.version, e);
            if let Some(hint) = e.suggestion() {
                error!("   Suggestion: {}", hint);
            }
            migration.error = Some(e.to_string());
            return;
        }
        migration.executed = true;
        info!("✅ Applied {} [{}]", migration.description, migration.risk_level);

        self.transition(run_id, RunState::Recording);
        let before = self.hooks.run(&hook_context(HookTrigger::BeforeDml, migration, None));
        if let Some(veto) = find_veto(&before) {
            warn!(
                "Hook '{}' vetoed recording {}: {}",
                veto.hook,
                migration.version,
                veto.veto_reason().unwrap_or_default()
            );
            return;
        }

        match self
            .storage
            .record_migration(
                &migration.version,
                &migration.description,
                &migration.downgrade_sql,
                migration.risk_level,
            )
            .await
        {
            Ok(result) => migration.recorded = result.success,
            Err(e) => warn!("Applied {} but could not record it: {}", migration.version, e),
        }

        self.hooks.run(&hook_context(HookTrigger::AfterDml, migration, None));
    }

    async fn execute_change(&self, change: &SchemaChange, migration: &mut Migration) -> Result<()> {
        if let (Some(plan), Dialect::Sqlite) = (&change.rebuild, self.db.dialect()) {
            // earlier changes in this run may have reshaped the table
            let live = self.detector().snapshot().await?;
            let current = plan.rebase(&live, &short_token())?;
            let reverse = current.reverse(&short_token())?;
            migration.upgrade_sql = current.script();
            migration.downgrade_sql = reverse.script();
            return rebuild::execute(self.db.as_ref(), &current).await;
        }

        let statements = split_statements(&change.upgrade_sql);
        debug!("Executing {}:\n{}", migration.version, change.upgrade_sql);
        self.db
            .execute_in_transaction(&statements)
            .await
            .map_err(|failure| MigrationError::execution(failure.error))
    }

    async fn checkpoint(&self, migration: &Migration, phase: HookTrigger, error: Option<&str>) {
        let Some(checkpoints) = &self.checkpoints else {
            return;
        };
        let id = migration.version.as_str();
        let result = match (phase, error) {
            (HookTrigger::BeforeDdl, _) => checkpoints.mark_in_progress(id, id).await,
            (_, Some(e)) => checkpoints.mark_failed(id, id, e).await,
            (_, None) => checkpoints.mark_completed(id, id).await,
        };
        if let Err(e) = result {
            warn!("Checkpoint for {} not written: {}", id, e);
        }
    }

    // =========================================================================
    // CACHE
    // =========================================================================

    async fn cache_hit(&self, declared_hash: &str, live_checksum: &str) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        match cache.is_synchronised(declared_hash, live_checksum).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!("Schema cache lookup failed, detecting normally: {}", e);
                false
            }
        }
    }

    async fn cache_record(&self, declared_hash: &str, live_checksum: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.record(declared_hash, live_checksum).await {
                warn!("Schema cache not updated: {}", e);
            }
        }
    }

    async fn cache_invalidate(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate().await {
                warn!("Schema cache not invalidated: {}", e);
            }
        }
    }

    /// Remember the post-run schema, but only if it really matches
    async fn refresh_cache(&self, detector: &SchemaDetector, declared_hash: &str) {
        if self.cache.is_none() {
            return;
        }
        let synced = match detector.snapshot().await {
            Ok(live) => match detector.diff(&live) {
                Ok(remaining) if remaining.is_empty() => Some(live.checksum),
                _ => None,
            },
            Err(e) => {
                warn!("Could not re-read schema for the cache: {}", e);
                None
            }
        };
        match synced {
            Some(checksum) => self.cache_record(declared_hash, &checksum).await,
            None => self.cache_invalidate().await,
        }
    }

    // =========================================================================
    // ROLLBACK & QUERIES
    // =========================================================================

    /// Undo the newest `steps` recorded migrations, newest first
    ///
    /// Nothing to roll back (zero steps or empty history) is reported as a
    /// failed result, not an error.
    pub async fn rollback(&self, steps: usize) -> Result<OperationResult> {
        if steps == 0 {
            return Ok(OperationResult::failure(
                "Invalid rollback request",
                vec!["rollback steps must be at least 1".to_string()],
            )
            .with_meta("rolled_back", Vec::<String>::new()));
        }

        if !self.lock.acquire(self.lock_timeout).await? {
            return Ok(OperationResult::failure(
                "Could not acquire migration lock",
                vec![format!("lock '{}' is held elsewhere", self.lock.name())],
            ));
        }

        let outcome = self.rollback_locked(steps).await;

        if let Err(e) = self.lock.release().await {
            warn!("Failed to release lock '{}': {}", self.lock.name(), e);
        }
        outcome
    }

    async fn rollback_locked(&self, steps: usize) -> Result<OperationResult> {
        self.storage.initialize().await?;
        let records = self.storage.get_migration_history(steps).await?;
        if records.is_empty() {
            return Ok(OperationResult::failure(
                "No migrations to roll back",
                vec![format!("history table '{}' is empty", self.storage.table())],
            )
            .with_meta("rolled_back", Vec::<String>::new()));
        }

        let mut rolled_back: Vec<String> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        for record in &records {
            match self.rollback_one(record).await {
                Ok(()) => {
                    info!("↩️ Rolled back {}", record.version);
                    rolled_back.push(record.version.clone());
                }
                Err(e) => {
                    error!("❌ Rollback of {} failed: {}", record.version, e);
                    errors.push(format!("{}: {}", record.version, e));
                    if self.rollback_policy == RollbackPolicy::StopOnError {
                        break;
                    }
                }
            }
        }

        if !rolled_back.is_empty() {
            self.cache_invalidate().await;
        }

        let message = format!(
            "Rolled back {} of {} migration(s)",
            rolled_back.len(),
            records.len()
        );
        let result = if errors.is_empty() {
            OperationResult::ok(message)
        } else {
            OperationResult::failure(message, errors)
        };
        Ok(result.with_meta("rolled_back", rolled_back))
    }

    async fn rollback_one(&self, record: &MigrationRecord) -> Result<()> {
        let statements = split_statements(&record.rollback_sql);
        if statements.is_empty() {
            return Err(MigrationError::Validation(
                "no rollback SQL recorded".to_string(),
            ));
        }

        self.db
            .execute_in_transaction(&statements)
            .await
            .map_err(|failure| MigrationError::execution(failure.error))?;

        if !self.storage.delete_migration(&record.version).await? {
            warn!("History row {} vanished during rollback", record.version);
        }
        Ok(())
    }

    /// Newest-first migration history
    pub async fn get_history(&self, limit: usize) -> Result<Vec<MigrationRecord>> {
        self.storage.initialize().await?;
        self.storage.get_migration_history(limit).await
    }

    /// Detect and assess without executing anything
    pub async fn risk_summary(&self) -> Result<RiskSummary> {
        let changes = self.detector().detect_changes().await?;
        self.assessor.get_risk_summary(&changes)
    }
}

fn hook_context(trigger: HookTrigger, migration: &Migration, error: Option<String>) -> HookContext {
    let sql = match trigger {
        HookTrigger::BeforeDdl | HookTrigger::AfterDdl => migration.upgrade_sql.clone(),
        HookTrigger::BeforeDml | HookTrigger::AfterDml => migration.downgrade_sql.clone(),
    };
    HookContext {
        trigger,
        version: migration.version.clone(),
        change_type: migration.change_type,
        table: migration.table.clone(),
        column: migration.column.clone(),
        sql,
        risk_level: migration.risk_level,
        error,
    }
}

fn short_token() -> String {
    Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;
    use crate::schema::{ColumnDef, TableDef};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn sqlite() -> Arc<dyn Database> {
        Arc::new(SqliteDatabase::in_memory().await.unwrap())
    }

    fn users() -> SchemaMetadata {
        SchemaMetadata::new().table(
            TableDef::new("users")
                .column(ColumnDef::new("id", "INTEGER").primary_key())
                .column(ColumnDef::new("name", "VARCHAR(100)")),
        )
    }

    #[tokio::test]
    async fn test_versions_follow_base_prefix() {
        let engine = MigrationEngine::new(sqlite().await, users()).unwrap();
        let plan = engine
            .auto_migrate_versioned(MigrationMode::Safe, "release_7")
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(plan.migrations[0].version, "release_7_001");
        assert!(plan.migrations[0].recorded);
    }

    #[tokio::test]
    async fn test_generated_version_shape() {
        let engine = MigrationEngine::new(sqlite().await, users()).unwrap();
        let plan = engine.auto_migrate(MigrationMode::Safe).await.unwrap();
        let version = &plan.migrations[0].version;
        assert_eq!(version.len(), 14 + "_001_create_table_users".len());
        assert!(version.ends_with("_001_create_table_users"));
        assert!(version[..14].chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_empty_version_is_rejected() {
        let engine = MigrationEngine::new(sqlite().await, users()).unwrap();
        let err = engine
            .auto_migrate_versioned(MigrationMode::Safe, "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_rollback_rejects_zero_steps() {
        let lock = MemoryLock::new("test");
        let engine = MigrationEngine::new(sqlite().await, users())
            .unwrap()
            .with_lock(Arc::new(lock.clone()), Duration::from_millis(100));
        let result = engine.rollback(0).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_lock_released_after_run() {
        let lock = MemoryLock::new("test");
        let engine = MigrationEngine::new(sqlite().await, users())
            .unwrap()
            .with_lock(Arc::new(lock.clone()), Duration::from_millis(100));
        engine.auto_migrate(MigrationMode::Safe).await.unwrap();
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_lock_released_after_detection_error() {
        let lock = MemoryLock::new("test");
        let bad = SchemaMetadata::new().table(TableDef::new("users"));
        let engine = MigrationEngine::new(sqlite().await, bad)
            .unwrap()
            .with_lock(Arc::new(lock.clone()), Duration::from_millis(100));
        assert!(engine.auto_migrate(MigrationMode::Safe).await.is_err());
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_failing_risk_rule_aborts_before_execution() {
        let db = sqlite().await;
        let mut engine = MigrationEngine::new(db.clone(), users()).unwrap();
        engine.add_risk_rule(crate::risk::FnRiskRule::new("broken", |_, _| {
            Err("rule exploded".to_string())
        }));

        let err = engine.auto_migrate(MigrationMode::Aggressive).await.unwrap_err();
        assert!(matches!(err, MigrationError::RiskAssessment { .. }));
        assert!(db.introspect().await.unwrap().get_table("users").is_none());
    }

    #[tokio::test]
    async fn test_hooks_fire_in_phase_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut engine = MigrationEngine::new(sqlite().await, users()).unwrap();
        for trigger in [
            HookTrigger::AfterDml,
            HookTrigger::BeforeDml,
            HookTrigger::AfterDdl,
            HookTrigger::BeforeDdl,
        ] {
            let seen = seen.clone();
            engine.register_migration_hook(trigger.to_string(), trigger, 0, move |ctx| {
                seen.lock().unwrap().push(ctx.trigger);
                Ok(HookOutcome::Continue)
            });
        }

        engine.auto_migrate(MigrationMode::Safe).await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                HookTrigger::BeforeDdl,
                HookTrigger::AfterDdl,
                HookTrigger::BeforeDml,
                HookTrigger::AfterDml
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_ddl_is_reported_and_run_continues() {
        let db = sqlite().await;
        // the declared default is invalid SQL, so CREATE TABLE fails
        let metadata = SchemaMetadata::new()
            .table(
                TableDef::new("broken")
                    .column(ColumnDef::new("id", "INTEGER").primary_key())
                    .column(ColumnDef::new("x", "TEXT").default_value("(((")),
            )
            .table(TableDef::new("fine").column(ColumnDef::new("id", "INTEGER").primary_key()));

        let after_ddl_errors = Arc::new(AtomicUsize::new(0));
        let counter = after_ddl_errors.clone();
        let mut engine = MigrationEngine::new(db.clone(), metadata).unwrap();
        engine.register_migration_hook("count", HookTrigger::AfterDdl, 0, move |ctx| {
            if ctx.error.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(HookOutcome::Continue)
        });

        let plan = engine.auto_migrate(MigrationMode::Safe).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(plan.failed().count(), 1);
        assert_eq!(plan.applied().count(), 1);
        assert_eq!(after_ddl_errors.load(Ordering::SeqCst), 1);

        let history = engine.get_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].version.ends_with("create_table_fine"));
    }

    #[tokio::test]
    async fn test_checkpoints_track_each_migration() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MigrationEngine::new(sqlite().await, users())
            .unwrap()
            .with_checkpoints(CheckpointManager::new(dir.path()));

        let plan = engine.auto_migrate(MigrationMode::Safe).await.unwrap();
        let version = &plan.migrations[0].version;

        let checkpoints = engine.checkpoints().unwrap();
        let record = checkpoints.get(version).await.unwrap().unwrap();
        assert_eq!(record.status, crate::checkpoint::CheckpointStatus::Completed);
        assert!(checkpoints.get_pending_migrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_risk_summary_executes_nothing() {
        let db = sqlite().await;
        let engine = MigrationEngine::new(db.clone(), users()).unwrap();
        let summary = engine.risk_summary().await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.safe, 1);
        assert!(db.introspect().await.unwrap().get_table("users").is_none());
    }
}
