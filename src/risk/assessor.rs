//! Risk assessor
//!
//! Classifies each detected change as safe, medium or high risk. Custom
//! [`RiskRule`]s run first, in registration order; the first rule that
//! returns a level wins. Changes no rule claims fall through to the default
//! classification table.

use super::compat::{TypeCompatibility, TypeCompatibilityChecker};
use crate::db::Dialect;
use crate::error::{MigrationError, Result};
use crate::types::{ChangeType, RiskLevel, SchemaChange};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

// =============================================================================
// RULES
// =============================================================================

/// A pluggable risk classification rule
pub trait RiskRule: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` defers to the next rule; `Err` aborts the assessment
    fn evaluate(
        &self,
        change: &SchemaChange,
        dialect: Dialect,
    ) -> std::result::Result<Option<RiskLevel>, String>;
}

/// Adapter turning a closure into a [`RiskRule`]
pub struct FnRiskRule<F> {
    name: String,
    f: F,
}

impl<F> FnRiskRule<F>
where
    F: Fn(&SchemaChange, Dialect) -> std::result::Result<Option<RiskLevel>, String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> RiskRule for FnRiskRule<F>
where
    F: Fn(&SchemaChange, Dialect) -> std::result::Result<Option<RiskLevel>, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        change: &SchemaChange,
        dialect: Dialect,
    ) -> std::result::Result<Option<RiskLevel>, String> {
        (self.f)(change, dialect)
    }
}

// =============================================================================
// SUMMARY
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessedChange {
    pub change_type: ChangeType,
    pub table: String,
    pub column: Option<String>,
    pub description: String,
    pub risk_level: RiskLevel,
}

/// Pre-flight overview of a change list
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSummary {
    pub total: usize,
    pub safe: usize,
    pub medium: usize,
    pub high: usize,
    /// Change descriptions grouped by level
    pub by_level: BTreeMap<RiskLevel, Vec<String>>,
    pub changes: Vec<AssessedChange>,
}

impl RiskSummary {
    /// Whether any change needs aggressive mode
    pub fn requires_confirmation(&self) -> bool {
        self.medium + self.high > 0
    }
}

// =============================================================================
// ASSESSOR
// =============================================================================

pub struct AdvancedRiskAssessor {
    dialect: Dialect,
    checker: TypeCompatibilityChecker,
    rules: Vec<Box<dyn RiskRule>>,
}

impl AdvancedRiskAssessor {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            checker: TypeCompatibilityChecker::new(),
            rules: Vec::new(),
        }
    }

    pub fn add_rule(&mut self, rule: impl RiskRule + 'static) {
        self.rules.push(Box::new(rule));
    }

    pub fn with_rule(mut self, rule: impl RiskRule + 'static) -> Self {
        self.add_rule(rule);
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Risk level of one change
    ///
    /// An already-assessed change keeps its stored level.
    pub fn assess(&self, change: &SchemaChange) -> Result<RiskLevel> {
        if let Some(level) = change.risk_level {
            return Ok(level);
        }

        for rule in &self.rules {
            match rule.evaluate(change, self.dialect) {
                Ok(Some(level)) => {
                    debug!(
                        "Rule '{}' classified '{}' as {}",
                        rule.name(),
                        change.description,
                        level
                    );
                    return Ok(level);
                }
                Ok(None) => continue,
                Err(message) => {
                    return Err(MigrationError::RiskAssessment {
                        rule: rule.name().to_string(),
                        message,
                    })
                }
            }
        }

        Ok(self.default_level(change))
    }

    /// Assess every change in place
    pub fn assess_all(&self, changes: &mut [SchemaChange]) -> Result<()> {
        for change in changes.iter_mut() {
            let level = self.assess(change)?;
            change.risk_level = Some(level);
        }
        Ok(())
    }

    pub fn get_risk_summary(&self, changes: &[SchemaChange]) -> Result<RiskSummary> {
        let mut summary = RiskSummary {
            total: changes.len(),
            safe: 0,
            medium: 0,
            high: 0,
            by_level: BTreeMap::new(),
            changes: Vec::with_capacity(changes.len()),
        };

        for change in changes {
            let level = self.assess(change)?;
            match level {
                RiskLevel::Safe => summary.safe += 1,
                RiskLevel::Medium => summary.medium += 1,
                RiskLevel::High => summary.high += 1,
            }
            summary
                .by_level
                .entry(level)
                .or_default()
                .push(change.description.clone());
            summary.changes.push(AssessedChange {
                change_type: change.change_type,
                table: change.table.clone(),
                column: change.column.clone(),
                description: change.description.clone(),
                risk_level: level,
            });
        }

        Ok(summary)
    }

    fn default_level(&self, change: &SchemaChange) -> RiskLevel {
        match change.change_type {
            ChangeType::CreateTable | ChangeType::AddIndex => RiskLevel::Safe,
            ChangeType::DropTable | ChangeType::DropColumn | ChangeType::DropIndex => {
                RiskLevel::High
            }
            ChangeType::AddColumn => match &change.column_def {
                Some(def) if def.is_primary_key => RiskLevel::High,
                Some(def) if def.nullable || def.has_default() => RiskLevel::Safe,
                Some(_) => RiskLevel::High,
                // nothing to inspect, assume the worst
                None => RiskLevel::High,
            },
            ChangeType::ChangeColumn => self.type_change_level(change),
        }
    }

    fn type_change_level(&self, change: &SchemaChange) -> RiskLevel {
        if self.dialect == Dialect::Sqlite {
            return RiskLevel::High;
        }

        let (old, new) = match (&change.old_type, &change.new_type) {
            (Some(old), Some(new)) => (old.as_str(), new.as_str()),
            _ => return RiskLevel::High,
        };

        match self.checker.check_compatibility(old, new) {
            TypeCompatibility::Safe => {
                // MODIFY COLUMN copies the whole table on integer widening
                if self.dialect == Dialect::Mysql
                    && TypeCompatibilityChecker::is_integer_type(old)
                    && TypeCompatibilityChecker::is_integer_type(new)
                {
                    RiskLevel::Medium
                } else {
                    RiskLevel::Safe
                }
            }
            TypeCompatibility::Compatible => RiskLevel::Medium,
            TypeCompatibility::Incompatible => RiskLevel::High,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;

    fn add_column(def: ColumnDef) -> SchemaChange {
        SchemaChange::new(ChangeType::AddColumn, "users")
            .column(def.name.clone())
            .column_def(def)
            .description("add column")
    }

    fn change_column(old: &str, new: &str) -> SchemaChange {
        SchemaChange::new(ChangeType::ChangeColumn, "users")
            .column("age")
            .types(old, new)
            .description("change users.age")
    }

    #[test]
    fn test_add_column_levels() {
        let assessor = AdvancedRiskAssessor::new(Dialect::Postgres);
        assert_eq!(
            assessor.assess(&add_column(ColumnDef::new("bio", "TEXT"))).unwrap(),
            RiskLevel::Safe
        );
        assert_eq!(
            assessor
                .assess(&add_column(ColumnDef::new("n", "INTEGER").not_null().default_value("0")))
                .unwrap(),
            RiskLevel::Safe
        );
        assert_eq!(
            assessor
                .assess(&add_column(ColumnDef::new("n", "INTEGER").not_null()))
                .unwrap(),
            RiskLevel::High
        );
    }

    #[test]
    fn test_destructive_changes_are_high() {
        let assessor = AdvancedRiskAssessor::new(Dialect::Postgres);
        for ct in [ChangeType::DropTable, ChangeType::DropColumn, ChangeType::DropIndex] {
            let change = SchemaChange::new(ct, "users");
            assert_eq!(assessor.assess(&change).unwrap(), RiskLevel::High);
        }
    }

    #[test]
    fn test_sqlite_change_column_always_high() {
        let assessor = AdvancedRiskAssessor::new(Dialect::Sqlite);
        assert_eq!(
            assessor.assess(&change_column("INTEGER", "BIGINT")).unwrap(),
            RiskLevel::High
        );
    }

    #[test]
    fn test_type_change_levels_follow_compatibility() {
        let pg = AdvancedRiskAssessor::new(Dialect::Postgres);
        assert_eq!(pg.assess(&change_column("INTEGER", "BIGINT")).unwrap(), RiskLevel::Safe);
        assert_eq!(pg.assess(&change_column("BIGINT", "INTEGER")).unwrap(), RiskLevel::Medium);
        assert_eq!(pg.assess(&change_column("VARCHAR", "INTEGER")).unwrap(), RiskLevel::High);

        let my = AdvancedRiskAssessor::new(Dialect::Mysql);
        assert_eq!(my.assess(&change_column("INT", "BIGINT")).unwrap(), RiskLevel::Medium);
        assert_eq!(my.assess(&change_column("VARCHAR(10)", "TEXT")).unwrap(), RiskLevel::Safe);
    }

    #[test]
    fn test_custom_rule_first_match_wins() {
        let assessor = AdvancedRiskAssessor::new(Dialect::Postgres)
            .with_rule(FnRiskRule::new("audit-tables", |change: &SchemaChange, _| {
                Ok(change.table.starts_with("audit_").then_some(RiskLevel::High))
            }))
            .with_rule(FnRiskRule::new("everything-medium", |_: &SchemaChange, _| {
                Ok(Some(RiskLevel::Medium))
            }));

        let audit = SchemaChange::new(ChangeType::CreateTable, "audit_log");
        let users = SchemaChange::new(ChangeType::CreateTable, "users");
        assert_eq!(assessor.assess(&audit).unwrap(), RiskLevel::High);
        assert_eq!(assessor.assess(&users).unwrap(), RiskLevel::Medium);
    }

    #[test]
    fn test_rule_error_aborts_assessment() {
        let assessor = AdvancedRiskAssessor::new(Dialect::Sqlite).with_rule(FnRiskRule::new(
            "broken",
            |_: &SchemaChange, _| Err("lookup service down".to_string()),
        ));
        let mut changes = vec![SchemaChange::new(ChangeType::CreateTable, "users")];

        let err = assessor.assess_all(&mut changes).unwrap_err();
        match err {
            MigrationError::RiskAssessment { rule, message } => {
                assert_eq!(rule, "broken");
                assert_eq!(message, "lookup service down");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(changes[0].risk_level.is_none());
    }

    #[test]
    fn test_stored_level_is_kept() {
        let assessor = AdvancedRiskAssessor::new(Dialect::Postgres);
        let mut change = SchemaChange::new(ChangeType::DropTable, "users");
        change.risk_level = Some(RiskLevel::Safe);
        assert_eq!(assessor.assess(&change).unwrap(), RiskLevel::Safe);
    }

    #[test]
    fn test_summary_counts() {
        let assessor = AdvancedRiskAssessor::new(Dialect::Sqlite);
        let changes = vec![
            SchemaChange::new(ChangeType::CreateTable, "a").description("create a"),
            SchemaChange::new(ChangeType::DropTable, "b").description("drop b"),
            change_column("VARCHAR", "INTEGER"),
        ];
        let summary = assessor.get_risk_summary(&changes).unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.safe, 1);
        assert_eq!(summary.high, 2);
        assert!(summary.requires_confirmation());
        assert_eq!(summary.by_level[&RiskLevel::Safe], vec!["create a".to_string()]);
    }
}
