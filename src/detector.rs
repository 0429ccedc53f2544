//! Schema change detector
//!
//! Reflects the live database and diffs it against the declared
//! [`SchemaMetadata`], producing an ordered list of [`SchemaChange`]s with
//! upgrade and downgrade SQL attached.
//!
//! Ordering: declared tables in declaration order. Within a table, column
//! adds and type changes follow declaration order, column drops follow the
//! live ordinal order, then index changes. Tables that exist only in the
//! live database are dropped last, in name order.

use crate::db::{Database, Dialect};
use crate::ddl::{script, DdlGenerator};
use crate::error::{MigrationError, Result};
use crate::introspection::{SchemaSnapshot, Table};
use crate::rebuild::{TableRebuildPlan, TypeChange};
use crate::risk::TypeCompatibilityChecker;
use crate::schema::{ColumnDef, IndexDef, SchemaMetadata, TableDef};
use crate::types::{ChangeType, SchemaChange};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SchemaDetector {
    db: Arc<dyn Database>,
    metadata: SchemaMetadata,
    ignored: HashSet<String>,
    timeout: Option<Duration>,
}

impl SchemaDetector {
    pub fn new(db: Arc<dyn Database>, metadata: SchemaMetadata) -> Self {
        Self {
            db,
            metadata,
            ignored: HashSet::new(),
            timeout: None,
        }
    }

    /// Never report this table, in either direction
    pub fn ignore_table(mut self, name: impl Into<String>) -> Self {
        self.ignored.insert(name.into());
        self
    }

    pub fn ignore_tables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored.extend(names.into_iter().map(Into::into));
        self
    }

    /// Upper bound on a single reflection pass
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn metadata(&self) -> &SchemaMetadata {
        &self.metadata
    }

    pub fn dialect(&self) -> Dialect {
        self.db.dialect()
    }

    fn is_internal(&self, table: &str) -> bool {
        self.ignored.contains(table) || table.starts_with("sqlite_")
    }

    /// Reflect the live schema, honouring the detection timeout
    pub async fn snapshot(&self) -> Result<SchemaSnapshot> {
        let reflected = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.db.introspect())
                .await
                .map_err(|_| MigrationError::detection_timeout(limit))?,
            None => self.db.introspect().await,
        };
        reflected.map_err(MigrationError::detection)
    }

    /// Reflect the live schema and diff it against the declaration
    pub async fn detect_changes(&self) -> Result<Vec<SchemaChange>> {
        self.metadata.validate()?;
        let live = self.snapshot().await?;
        let changes = self.diff(&live)?;
        info!(
            "🔍 Detected {} schema change(s) against {} live tables",
            changes.len(),
            live.tables.len()
        );
        Ok(changes)
    }

    /// Diff a reflected snapshot against the declaration
    pub fn diff(&self, live: &SchemaSnapshot) -> Result<Vec<SchemaChange>> {
        let gen = DdlGenerator::new(live.dialect);
        let token: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let mut changes = Vec::new();

        for declared in &self.metadata.tables {
            if self.is_internal(&declared.name) {
                continue;
            }
            match live.get_table(&declared.name) {
                None => self.diff_new_table(&gen, declared, &mut changes),
                Some(live_table) => {
                    self.diff_existing_table(&gen, declared, live_table, live, &token, &mut changes)?
                }
            }
        }

        let mut orphaned: Vec<&Table> = live
            .tables
            .iter()
            .filter(|t| !self.is_internal(&t.name) && self.metadata.get_table(&t.name).is_none())
            .collect();
        orphaned.sort_by(|a, b| a.name.cmp(&b.name));

        for table in orphaned {
            let restore = live_table_def(table, live);
            let mut downgrade = vec![gen.create_table(&restore)];
            downgrade.extend(restore.indexes.iter().map(|i| gen.create_index(&table.name, i)));

            changes.push(
                SchemaChange::new(ChangeType::DropTable, &table.name)
                    .description(format!("Drop table '{}'", table.name))
                    .sql(gen.drop_table(&table.name), script(&downgrade)),
            );
        }

        debug!("Diff produced {} change(s)", changes.len());
        Ok(changes)
    }

    fn diff_new_table(&self, gen: &DdlGenerator, table: &TableDef, changes: &mut Vec<SchemaChange>) {
        changes.push(
            SchemaChange::new(ChangeType::CreateTable, &table.name)
                .description(format!(
                    "Create table '{}' ({} columns)",
                    table.name,
                    table.columns.len()
                ))
                .sql(gen.create_table(table), gen.drop_table(&table.name)),
        );
        for index in &table.indexes {
            changes.push(add_index_change(gen, &table.name, index));
        }
    }

    fn diff_existing_table(
        &self,
        gen: &DdlGenerator,
        declared: &TableDef,
        live_table: &Table,
        live: &SchemaSnapshot,
        token: &str,
        changes: &mut Vec<SchemaChange>,
    ) -> Result<()> {
        let table = declared.name.as_str();
        // SQLite rebuilds on one table accumulate
        let mut type_changes: Vec<TypeChange> = Vec::new();

        for col in &declared.columns {
            let Some(live_col) = live_table.get_column(&col.name) else {
                changes.push(
                    SchemaChange::new(ChangeType::AddColumn, table)
                        .column(&col.name)
                        .description(format!(
                            "Add column '{}.{}' ({})",
                            table, col.name, col.data_type
                        ))
                        .sql(gen.add_column(table, col), gen.drop_column(table, &col.name))
                        .column_def(col.clone()),
                );
                continue;
            };

            let old_type = TypeCompatibilityChecker::normalize_type(&live_col.data_type);
            let new_type = TypeCompatibilityChecker::normalize_type(&col.data_type);
            if old_type == new_type {
                continue;
            }

            let mut change = SchemaChange::new(ChangeType::ChangeColumn, table)
                .column(&col.name)
                .types(&old_type, &new_type)
                .description(format!(
                    "Change column '{}.{}' from {} to {}",
                    table, col.name, old_type, new_type
                ))
                .column_def(col.clone());

            match gen.alter_column_type(table, col) {
                Some(upgrade) => {
                    let previous = ColumnDef::from(live_col);
                    let downgrade = gen
                        .alter_column_type(table, &previous)
                        .unwrap_or_default();
                    change = change.sql(upgrade, downgrade);
                }
                None => {
                    type_changes.push(TypeChange::new(
                        &col.name,
                        &live_col.data_type,
                        &col.data_type,
                    ));
                    let live_def = live_table_def(live_table, live);
                    let plan = TableRebuildPlan::build(
                        table,
                        &live_def.columns,
                        &live_def.indexes,
                        &type_changes,
                        token,
                    )?;
                    let reverse = plan.reverse(token)?;
                    change = change.sql(plan.script(), reverse.script()).rebuild(plan);
                }
            }
            changes.push(change);
        }

        let mut dropped: Vec<_> = live_table
            .columns
            .iter()
            .filter(|c| declared.get_column(&c.name).is_none())
            .collect();
        dropped.sort_by_key(|c| c.ordinal_position);

        for live_col in dropped {
            changes.push(
                SchemaChange::new(ChangeType::DropColumn, table)
                    .column(&live_col.name)
                    .description(format!("Drop column '{}.{}'", table, live_col.name))
                    .sql(
                        gen.drop_column(table, &live_col.name),
                        gen.add_column(table, &ColumnDef::from(live_col)),
                    ),
            );
        }

        let live_indexes: Vec<_> = live.indexes_for(table).collect();
        for index in &declared.indexes {
            if !live_indexes.iter().any(|i| i.name == index.name) {
                changes.push(add_index_change(gen, table, index));
            }
        }
        for index in live_indexes {
            if declared.indexes.iter().any(|i| i.name == index.name) {
                continue;
            }
            changes.push(
                SchemaChange::new(ChangeType::DropIndex, table)
                    .index(&index.name)
                    .description(format!("Drop index '{}' on '{}'", index.name, table))
                    .sql(
                        gen.drop_index(table, &index.name),
                        gen.create_index(table, &IndexDef::from(index)),
                    ),
            );
        }

        Ok(())
    }
}

fn add_index_change(gen: &DdlGenerator, table: &str, index: &IndexDef) -> SchemaChange {
    SchemaChange::new(ChangeType::AddIndex, table)
        .index(&index.name)
        .description(format!(
            "Add {}index '{}' on '{}' ({})",
            if index.unique { "unique " } else { "" },
            index.name,
            table,
            index.columns.join(", ")
        ))
        .sql(gen.create_index(table, index), gen.drop_index(table, &index.name))
}

/// Declared-form definition of a live table, columns in ordinal order
fn live_table_def(table: &Table, live: &SchemaSnapshot) -> TableDef {
    let mut columns: Vec<_> = table.columns.iter().collect();
    columns.sort_by_key(|c| c.ordinal_position);

    TableDef {
        name: table.name.clone(),
        columns: columns.into_iter().map(ColumnDef::from).collect(),
        indexes: live.indexes_for(&table.name).map(IndexDef::from).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;
    use crate::introspection::{Column, Index};
    use pretty_assertions::assert_eq;

    fn column(name: &str, data_type: &str, ordinal: i32) -> Column {
        Column {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            default_value: None,
            is_primary_key: false,
            ordinal_position: ordinal,
        }
    }

    fn live_users(dialect: Dialect) -> SchemaSnapshot {
        let users = Table {
            name: "users".to_string(),
            columns: vec![
                Column {
                    is_primary_key: true,
                    nullable: false,
                    ..column("id", "INTEGER", 1)
                },
                column("legacy", "TEXT", 2),
                column("age", "VARCHAR(10)", 3),
            ],
        };
        let history = Table {
            name: "_schemaflow_migrations".to_string(),
            columns: vec![column("version", "TEXT", 1)],
        };
        let orphan = Table {
            name: "old_sessions".to_string(),
            columns: vec![column("token", "TEXT", 1)],
        };
        let indexes = vec![Index {
            name: "idx_users_legacy".to_string(),
            table: "users".to_string(),
            columns: vec!["legacy".to_string()],
            is_unique: false,
        }];
        SchemaSnapshot::new(dialect, vec![users, history, orphan], indexes)
    }

    fn declared() -> SchemaMetadata {
        SchemaMetadata::new()
            .table(
                TableDef::new("users")
                    .column(ColumnDef::new("id", "INTEGER").primary_key())
                    .column(ColumnDef::new("age", "INTEGER"))
                    .column(ColumnDef::new("email", "VARCHAR(255)"))
                    .index(IndexDef::new("idx_users_email", &["email"]).unique()),
            )
            .table(
                TableDef::new("posts")
                    .column(ColumnDef::new("id", "INTEGER").primary_key())
                    .index(IndexDef::new("idx_posts_id", &["id"])),
            )
    }

    async fn detector(metadata: SchemaMetadata) -> SchemaDetector {
        let db: Arc<dyn Database> = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        SchemaDetector::new(db, metadata).ignore_table("_schemaflow_migrations")
    }

    #[tokio::test]
    async fn test_diff_order_and_kinds() {
        let detector = detector(declared()).await;
        let changes = detector.diff(&live_users(Dialect::Sqlite)).unwrap();

        let summary: Vec<(ChangeType, &str, Option<&str>)> = changes
            .iter()
            .map(|c| {
                (
                    c.change_type,
                    c.table.as_str(),
                    c.column.as_deref().or(c.index.as_deref()),
                )
            })
            .collect();

        assert_eq!(
            summary,
            vec![
                (ChangeType::ChangeColumn, "users", Some("age")),
                (ChangeType::AddColumn, "users", Some("email")),
                (ChangeType::DropColumn, "users", Some("legacy")),
                (ChangeType::AddIndex, "users", Some("idx_users_email")),
                (ChangeType::DropIndex, "users", Some("idx_users_legacy")),
                (ChangeType::CreateTable, "posts", None),
                (ChangeType::AddIndex, "posts", Some("idx_posts_id")),
                (ChangeType::DropTable, "old_sessions", None),
            ]
        );
    }

    #[tokio::test]
    async fn test_sqlite_type_change_carries_rebuild() {
        let detector = detector(declared()).await;
        let changes = detector.diff(&live_users(Dialect::Sqlite)).unwrap();
        let change = &changes[0];

        assert_eq!(change.old_type.as_deref(), Some("VARCHAR"));
        assert_eq!(change.new_type.as_deref(), Some("INTEGER"));
        let plan = change.rebuild.as_ref().unwrap();
        assert!(plan.shadow_table.starts_with("_users_shadow_"));
        assert!(change.upgrade_sql.contains("CAST(\"age\" AS INTEGER)"));
        assert!(change.downgrade_sql.contains("CAST(\"age\" AS VARCHAR(10))"));
    }

    #[tokio::test]
    async fn test_postgres_type_change_is_in_place() {
        let detector = detector(declared()).await;
        let changes = detector.diff(&live_users(Dialect::Postgres)).unwrap();
        let change = &changes[0];
        assert!(change.rebuild.is_none());
        assert!(change.upgrade_sql.contains("ALTER COLUMN \"age\" TYPE INTEGER"));
        assert!(change.downgrade_sql.contains("TYPE VARCHAR(10)"));
    }

    #[tokio::test]
    async fn test_drop_table_downgrade_recreates_live_structure() {
        let detector = detector(declared()).await;
        let changes = detector.diff(&live_users(Dialect::Sqlite)).unwrap();
        let drop = changes.last().unwrap();
        assert_eq!(drop.upgrade_sql, "DROP TABLE \"old_sessions\"");
        assert!(drop.downgrade_sql.starts_with("CREATE TABLE \"old_sessions\""));
    }

    #[tokio::test]
    async fn test_detection_is_idempotent_against_live_database() {
        let detector = detector(declared()).await;
        detector
            .db
            .execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, age VARCHAR(10))")
            .await
            .unwrap();

        let first = detector.detect_changes().await.unwrap();
        let second = detector.detect_changes().await.unwrap();
        let keys = |c: &Vec<SchemaChange>| {
            c.iter()
                .map(|c| format!("{:?}", c.key()))
                .collect::<Vec<_>>()
        };
        assert_eq!(keys(&first), keys(&second));
        assert!(!first.is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_internal_tables_are_never_reported() {
        let detector = detector(SchemaMetadata::new()).await;
        detector
            .db
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT)")
            .await
            .unwrap();
        // sqlite_sequence now exists
        let changes = detector.detect_changes().await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].table, "t");
    }
}
