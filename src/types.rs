//! Shared types for a migration run

use crate::rebuild::TableRebuildPlan;
use crate::schema::ColumnDef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// RISK LEVEL
// =============================================================================

/// Ordered risk classification of a single change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(RiskLevel::Safe),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(format!("unknown risk level '{}'", other)),
        }
    }
}

// =============================================================================
// SCHEMA CHANGES
// =============================================================================

/// Kind of structural difference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    CreateTable,
    DropTable,
    AddColumn,
    DropColumn,
    ChangeColumn,
    AddIndex,
    DropIndex,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::CreateTable => "create_table",
            ChangeType::DropTable => "drop_table",
            ChangeType::AddColumn => "add_column",
            ChangeType::DropColumn => "drop_column",
            ChangeType::ChangeColumn => "change_column",
            ChangeType::AddIndex => "add_index",
            ChangeType::DropIndex => "drop_index",
        }
    }

    /// Whether applying the change can lose stored data
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            ChangeType::DropTable | ChangeType::DropColumn | ChangeType::ChangeColumn
        )
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structural difference between the live schema and the declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaChange {
    pub change_type: ChangeType,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_type: Option<String>,
    pub description: String,
    pub upgrade_sql: String,
    pub downgrade_sql: String,
    /// Assigned once by the assessor
    pub risk_level: Option<RiskLevel>,
    /// Declared definition of the column, for add/change column
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_def: Option<ColumnDef>,
    /// Copy-swap-rename sequence for SQLite type changes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuild: Option<TableRebuildPlan>,
}

impl SchemaChange {
    pub fn new(change_type: ChangeType, table: impl Into<String>) -> Self {
        Self {
            change_type,
            table: table.into(),
            column: None,
            index: None,
            old_type: None,
            new_type: None,
            description: String::new(),
            upgrade_sql: String::new(),
            downgrade_sql: String::new(),
            risk_level: None,
            column_def: None,
            rebuild: None,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn types(mut self, old_type: impl Into<String>, new_type: impl Into<String>) -> Self {
        self.old_type = Some(old_type.into());
        self.new_type = Some(new_type.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn sql(mut self, upgrade: impl Into<String>, downgrade: impl Into<String>) -> Self {
        self.upgrade_sql = upgrade.into();
        self.downgrade_sql = downgrade.into();
        self
    }

    pub fn column_def(mut self, def: ColumnDef) -> Self {
        self.column_def = Some(def);
        self
    }

    pub fn rebuild(mut self, plan: TableRebuildPlan) -> Self {
        self.rebuild = Some(plan);
        self
    }

    /// Identity used when comparing detection runs
    pub fn key(&self) -> (ChangeType, &str, Option<&str>, Option<&str>) {
        (
            self.change_type,
            self.table.as_str(),
            self.column.as_deref(),
            self.index.as_deref(),
        )
    }
}

// =============================================================================
// MIGRATIONS AND PLANS
// =============================================================================

/// Which risk levels a run may apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMode {
    /// Only `Safe` changes are executed
    #[default]
    Safe,
    /// Every detected change is executed
    Aggressive,
}

impl MigrationMode {
    pub fn allows(&self, level: RiskLevel) -> bool {
        match self {
            MigrationMode::Safe => level == RiskLevel::Safe,
            MigrationMode::Aggressive => true,
        }
    }
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationMode::Safe => f.write_str("safe"),
            MigrationMode::Aggressive => f.write_str("aggressive"),
        }
    }
}

impl FromStr for MigrationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(MigrationMode::Safe),
            "aggressive" => Ok(MigrationMode::Aggressive),
            other => Err(format!(
                "unknown migration mode '{}' (expected safe or aggressive)",
                other
            )),
        }
    }
}

/// What `rollback` does after a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    /// Stop at the first failing step
    #[default]
    StopOnError,
    /// Attempt every requested step and report all failures
    ContinueOnError,
}

impl FromStr for RollbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" | "stop_on_error" => Ok(RollbackPolicy::StopOnError),
            "continue" | "continue_on_error" => Ok(RollbackPolicy::ContinueOnError),
            other => Err(format!(
                "unknown rollback policy '{}' (expected stop or continue)",
                other
            )),
        }
    }
}

/// A planned change annotated with its execution outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    pub version: String,
    pub change_type: ChangeType,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub description: String,
    pub upgrade_sql: String,
    pub downgrade_sql: String,
    pub risk_level: RiskLevel,
    pub executed: bool,
    /// History row written; false when recording failed
    pub recorded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Migration {
    pub fn from_change(version: String, change: &SchemaChange, risk_level: RiskLevel) -> Self {
        Self {
            version,
            change_type: change.change_type,
            table: change.table.clone(),
            column: change.column.clone(),
            description: change.description.clone(),
            upgrade_sql: change.upgrade_sql.clone(),
            downgrade_sql: change.downgrade_sql.clone(),
            risk_level,
            executed: false,
            recorded: false,
            skip_reason: None,
            error: None,
        }
    }

    pub fn is_withheld(&self) -> bool {
        !self.executed && self.skip_reason.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Aggregate outcome of one `auto_migrate` run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    UpToDate,
    Completed,
    Partial,
    Skipped,
    Failed,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::UpToDate => "up_to_date",
            PlanStatus::Completed => "completed",
            PlanStatus::Partial => "partial",
            PlanStatus::Skipped => "skipped",
            PlanStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub run_id: Uuid,
    pub mode: MigrationMode,
    pub status: PlanStatus,
    pub migrations: Vec<Migration>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationPlan {
    pub fn new(mode: MigrationMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            status: PlanStatus::UpToDate,
            migrations: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Plan for a run that never obtained the lock
    pub fn skipped(mode: MigrationMode) -> Self {
        let mut plan = Self::new(mode);
        plan.finish(PlanStatus::Skipped);
        plan
    }

    pub fn finish(&mut self, status: PlanStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Derive the aggregate status from the individual outcomes
    pub fn resolve_status(&self) -> PlanStatus {
        if self.migrations.is_empty() {
            PlanStatus::UpToDate
        } else if self.migrations.iter().any(Migration::is_failed) {
            PlanStatus::Failed
        } else if self.migrations.iter().any(Migration::is_withheld) {
            PlanStatus::Partial
        } else {
            PlanStatus::Completed
        }
    }

    pub fn applied(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter().filter(|m| m.executed)
    }

    pub fn withheld(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter().filter(|m| m.is_withheld())
    }

    pub fn failed(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter().filter(|m| m.is_failed())
    }

    /// Human-readable listing of applied and withheld changes
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Migration run {} ({} mode): {}",
            self.run_id, self.mode, self.status
        )];

        for m in self.applied() {
            lines.push(format!("  applied  [{}] {}", m.risk_level, m.description));
        }
        for m in self.withheld() {
            lines.push(format!(
                "  withheld [{}] {}: {}",
                m.risk_level,
                m.description,
                m.skip_reason.as_deref().unwrap_or("")
            ));
        }
        for m in self.failed() {
            lines.push(format!(
                "  failed   [{}] {}: {}",
                m.risk_level,
                m.description,
                m.error.as_deref().unwrap_or("")
            ));
        }
        lines.join("\n")
    }
}

// =============================================================================
// OPERATION RESULT
// =============================================================================

/// Outcome of a storage or rollback operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    pub errors: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            errors,
            metadata: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Boolean metadata flag, `false` when absent
    pub fn flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(executed: bool, skip: Option<&str>, error: Option<&str>) -> Migration {
        let change = SchemaChange::new(ChangeType::AddColumn, "users")
            .column("bio")
            .description("add users.bio");
        let mut m = Migration::from_change("v".to_string(), &change, RiskLevel::Safe);
        m.executed = executed;
        m.skip_reason = skip.map(String::from);
        m.error = error.map(String::from);
        m
    }

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Safe < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert_eq!("HIGH".parse::<RiskLevel>().unwrap(), RiskLevel::High);
    }

    #[test]
    fn test_mode_filter() {
        assert!(MigrationMode::Safe.allows(RiskLevel::Safe));
        assert!(!MigrationMode::Safe.allows(RiskLevel::Medium));
        assert!(MigrationMode::Aggressive.allows(RiskLevel::High));
        assert!("turbo".parse::<MigrationMode>().is_err());
    }

    #[test]
    fn test_status_resolution() {
        let mut plan = MigrationPlan::new(MigrationMode::Safe);
        assert_eq!(plan.resolve_status(), PlanStatus::UpToDate);

        plan.migrations.push(migration(true, None, None));
        assert_eq!(plan.resolve_status(), PlanStatus::Completed);

        plan.migrations.push(migration(false, Some("risk"), None));
        assert_eq!(plan.resolve_status(), PlanStatus::Partial);

        plan.migrations.push(migration(false, None, Some("boom")));
        assert_eq!(plan.resolve_status(), PlanStatus::Failed);
    }

    #[test]
    fn test_summary_lists_withheld_reason() {
        let mut plan = MigrationPlan::new(MigrationMode::Safe);
        plan.migrations.push(migration(false, Some("needs aggressive"), None));
        plan.finish(plan.resolve_status());
        let summary = plan.summary();
        assert!(summary.contains("withheld"));
        assert!(summary.contains("needs aggressive"));
    }

    #[test]
    fn test_change_type_serialises_snake_case() {
        let json = serde_json::to_string(&ChangeType::ChangeColumn).unwrap();
        assert_eq!(json, "\"change_column\"");
    }
}
