//! SQLite table rebuild (copy-swap-rename)
//!
//! SQLite cannot change a column type in place. The table is rebuilt as a
//! fixed sequence of steps inside one transaction:
//!
//! ```text
//! Begin -> CreateShadow -> CopyRows -> DropOriginal -> RenameShadow
//!       -> RecreateIndexes -> Commit
//! ```
//!
//! Each step carries the statements that undo it. The transaction rollback
//! covers a failure at a known step; the compensating script is reported when
//! the outcome is ambiguous (a failed commit).

use crate::db::{Database, Dialect};
use crate::ddl::{quote_ident, script, DdlGenerator};
use crate::error::{MigrationError, Result};
use crate::introspection::SchemaSnapshot;
use crate::schema::{ColumnDef, IndexDef};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// One column type change applied by a rebuild
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeChange {
    pub column: String,
    pub old_type: String,
    pub new_type: String,
}

impl TypeChange {
    pub fn new(
        column: impl Into<String>,
        old_type: impl Into<String>,
        new_type: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            old_type: old_type.into(),
            new_type: new_type.into(),
        }
    }

    fn reversed(&self) -> Self {
        Self {
            column: self.column.clone(),
            old_type: self.new_type.clone(),
            new_type: self.old_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildStepKind {
    Begin,
    CreateShadow,
    CopyRows,
    DropOriginal,
    RenameShadow,
    RecreateIndexes,
    Commit,
}

impl RebuildStepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildStepKind::Begin => "begin",
            RebuildStepKind::CreateShadow => "create_shadow",
            RebuildStepKind::CopyRows => "copy_rows",
            RebuildStepKind::DropOriginal => "drop_original",
            RebuildStepKind::RenameShadow => "rename_shadow",
            RebuildStepKind::RecreateIndexes => "recreate_indexes",
            RebuildStepKind::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildStep {
    pub kind: RebuildStepKind,
    pub statements: Vec<String>,
    /// Statements that undo this step
    pub compensation: Vec<String>,
}

impl RebuildStep {
    fn marker(kind: RebuildStepKind) -> Self {
        Self {
            kind,
            statements: Vec::new(),
            compensation: Vec::new(),
        }
    }

    fn new(kind: RebuildStepKind, statements: Vec<String>, compensation: Vec<String>) -> Self {
        Self {
            kind,
            statements,
            compensation,
        }
    }
}

/// Full copy-swap-rename plan for one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRebuildPlan {
    pub table: String,
    pub shadow_table: String,
    /// Column definitions before the rebuild
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
    /// Type changes applied, in detection order
    pub type_changes: Vec<TypeChange>,
    pub steps: Vec<RebuildStep>,
}

impl TableRebuildPlan {
    /// Plan a rebuild of `table` applying every change in `changes`
    pub fn build(
        table: &str,
        columns: &[ColumnDef],
        indexes: &[IndexDef],
        changes: &[TypeChange],
        token: &str,
    ) -> Result<Self> {
        for change in changes {
            if !columns.iter().any(|c| c.name == change.column) {
                return Err(MigrationError::Validation(format!(
                    "cannot rebuild '{}': column '{}' does not exist",
                    table, change.column
                )));
            }
        }

        let shadow_table = format!("_{}_shadow_{}", table, token);
        let gen = DdlGenerator::new(Dialect::Sqlite);
        let q = |name: &str| quote_ident(Dialect::Sqlite, name);

        let target = apply_type_changes(columns, changes);

        let column_list: Vec<String> = target.iter().map(|c| q(&c.name)).collect();
        let select_list: Vec<String> = target
            .iter()
            .map(|col| {
                if changes.iter().any(|c| c.column == col.name) {
                    format!("CAST({} AS {})", q(&col.name), col.data_type)
                } else {
                    q(&col.name)
                }
            })
            .collect();

        let create_shadow = gen.create_table_named(&shadow_table, &target);
        let copy_rows = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            q(&shadow_table),
            column_list.join(", "),
            select_list.join(", "),
            q(table)
        );
        let drop_original = gen.drop_table(table);
        let rename_shadow = format!("ALTER TABLE {} RENAME TO {}", q(&shadow_table), q(table));
        let recreate: Vec<String> = indexes.iter().map(|i| gen.create_index(table, i)).collect();
        let drop_recreated: Vec<String> = indexes
            .iter()
            .map(|i| gen.drop_index(table, &i.name))
            .collect();

        let steps = vec![
            RebuildStep::marker(RebuildStepKind::Begin),
            RebuildStep::new(
                RebuildStepKind::CreateShadow,
                vec![create_shadow],
                vec![format!("DROP TABLE IF EXISTS {}", q(&shadow_table))],
            ),
            RebuildStep::new(
                RebuildStepKind::CopyRows,
                vec![copy_rows],
                vec![format!("DELETE FROM {}", q(&shadow_table))],
            ),
            RebuildStep::new(
                RebuildStepKind::DropOriginal,
                vec![drop_original],
                vec![gen.create_table_named(table, columns)],
            ),
            RebuildStep::new(
                RebuildStepKind::RenameShadow,
                vec![rename_shadow],
                vec![format!("ALTER TABLE {} RENAME TO {}", q(table), q(&shadow_table))],
            ),
            RebuildStep::new(RebuildStepKind::RecreateIndexes, recreate, drop_recreated),
            RebuildStep::marker(RebuildStepKind::Commit),
        ];

        Ok(Self {
            table: table.to_string(),
            shadow_table,
            columns: columns.to_vec(),
            indexes: indexes.to_vec(),
            type_changes: changes.to_vec(),
            steps,
        })
    }

    /// Column definitions after the rebuild
    pub fn target_columns(&self) -> Vec<ColumnDef> {
        apply_type_changes(&self.columns, &self.type_changes)
    }

    /// Plan that undoes this rebuild's own type change
    ///
    /// Plans for one table are cumulative: the last entry of `type_changes`
    /// is the change the plan was made for, earlier entries belong to
    /// migrations that are recorded and rolled back on their own.
    pub fn reverse(&self, token: &str) -> Result<Self> {
        let own = self.type_changes.last().ok_or_else(|| {
            MigrationError::Validation(format!(
                "rebuild of '{}' carries no type change",
                self.table
            ))
        })?;
        Self::build(
            &self.table,
            &self.target_columns(),
            &self.indexes,
            &[own.reversed()],
            token,
        )
    }

    /// Re-plan against the current live table, keeping the same type changes
    ///
    /// Earlier changes in the same run (an added column, a previous rebuild)
    /// alter the table after detection; rebasing picks them up.
    pub fn rebase(&self, snapshot: &SchemaSnapshot, token: &str) -> Result<Self> {
        let live = snapshot.get_table(&self.table).ok_or_else(|| {
            MigrationError::Validation(format!(
                "cannot rebuild '{}': table no longer exists",
                self.table
            ))
        })?;

        let mut ordered: Vec<_> = live.columns.iter().collect();
        ordered.sort_by_key(|c| c.ordinal_position);
        let columns: Vec<ColumnDef> = ordered.into_iter().map(ColumnDef::from).collect();
        let indexes: Vec<IndexDef> = snapshot.indexes_for(&self.table).map(IndexDef::from).collect();

        Self::build(&self.table, &columns, &indexes, &self.type_changes, token)
    }

    /// Executable statements in order, without transaction control
    pub fn statements(&self) -> Vec<String> {
        self.steps
            .iter()
            .flat_map(|s| s.statements.iter().cloned())
            .collect()
    }

    pub fn script(&self) -> String {
        script(&self.statements())
    }

    /// Step that owns the statement at `index` in [`statements`](Self::statements)
    pub fn step_for_statement(&self, index: usize) -> Option<&RebuildStep> {
        let mut offset = 0;
        for step in &self.steps {
            if index < offset + step.statements.len() {
                return Some(step);
            }
            offset += step.statements.len();
        }
        None
    }

    /// Undo script for every step up to and including `kind`, newest first
    pub fn compensation_script(&self, kind: RebuildStepKind) -> String {
        let mut undo = Vec::new();
        for step in &self.steps {
            undo.push(step.compensation.clone());
            if step.kind == kind {
                break;
            }
        }
        let statements: Vec<String> = undo.into_iter().rev().flatten().collect();
        script(&statements)
    }
}

fn apply_type_changes(columns: &[ColumnDef], changes: &[TypeChange]) -> Vec<ColumnDef> {
    columns
        .iter()
        .map(|col| {
            let mut col = col.clone();
            // later changes to the same column win
            if let Some(change) = changes.iter().rev().find(|c| c.column == col.name) {
                col.data_type = change.new_type.clone();
            }
            col
        })
        .collect()
}

/// Run a rebuild plan atomically
pub async fn execute(db: &dyn Database, plan: &TableRebuildPlan) -> Result<()> {
    debug!(
        "Rebuilding '{}' via shadow table '{}' ({} type changes)",
        plan.table,
        plan.shadow_table,
        plan.type_changes.len()
    );

    match db.execute_in_transaction(&plan.statements()).await {
        Ok(()) => {
            info!("✅ Rebuilt table '{}'", plan.table);
            Ok(())
        }
        Err(failure) => {
            let cause = failure.error.cause();
            let message = match failure.index.and_then(|i| plan.step_for_statement(i)) {
                Some(step) => format!(
                    "rebuild of '{}' failed at step {} and was rolled back: {}",
                    plan.table,
                    step.kind.as_str(),
                    failure.error
                ),
                None => {
                    // commit outcome unknown, hand the operator the undo script
                    let recovery = plan.compensation_script(RebuildStepKind::Commit);
                    error!(
                        "Rebuild of '{}' ended in an unknown state; recovery script:\n{}",
                        plan.table, recovery
                    );
                    format!(
                        "rebuild of '{}' could not be committed: {}",
                        plan.table, failure.error
                    )
                }
            };
            Err(MigrationError::MigrationExecution { message, cause })
        }
    }
}
