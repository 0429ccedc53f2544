//! SQLite backend
//!
//! Reflection goes through `sqlite_master` and the `table_info` /
//! `index_list` / `index_info` pragmas.

use super::{Database, DbResult, Dialect, StatementFailure};
use crate::ddl::quote_ident;
use crate::error::DbError;
use crate::introspection::{Column, Index, SchemaSnapshot, Table};
use crate::storage::MigrationRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row};
use std::str::FromStr;
use tracing::{debug, warn};

pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Open a pool for a `sqlite:` URL
    ///
    /// In-memory databases are private to a connection, so their pool is
    /// pinned to a single connection that is never recycled.
    pub async fn connect(url: &str) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database
    pub async fn in_memory() -> DbResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn get_columns(&self, table: &str) -> DbResult<Vec<Column>> {
        let sql = format!("PRAGMA table_info({})", quote_ident(Dialect::Sqlite, table));
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let cid: i64 = row.try_get("cid")?;
                let notnull: i64 = row.try_get("notnull")?;
                let pk: i64 = row.try_get("pk")?;
                Ok(Column {
                    name: row.try_get("name")?,
                    data_type: row.try_get("type")?,
                    nullable: notnull == 0 && pk == 0,
                    default_value: row.try_get("dflt_value")?,
                    is_primary_key: pk > 0,
                    ordinal_position: cid as i32 + 1,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(DbError::from)
    }

    async fn get_indexes(&self, table: &str) -> DbResult<Vec<Index>> {
        let sql = format!("PRAGMA index_list({})", quote_ident(Dialect::Sqlite, table));
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut indexes = Vec::new();
        for row in rows {
            let origin: String = row.try_get("origin")?;
            // "pk" and "u" indexes back table constraints
            if origin != "c" {
                continue;
            }
            let name: String = row.try_get("name")?;
            let unique: i64 = row.try_get("unique")?;

            let info_sql = format!("PRAGMA index_info({})", quote_ident(Dialect::Sqlite, &name));
            let info_rows = sqlx::query(&info_sql).fetch_all(&self.pool).await?;
            let mut cols: Vec<(i64, String)> = Vec::new();
            for info in info_rows {
                let seqno: i64 = info.try_get("seqno")?;
                let col: Option<String> = info.try_get("name")?;
                // expression indexes have no column name
                if let Some(col) = col {
                    cols.push((seqno, col));
                }
            }
            cols.sort_by_key(|(seq, _)| *seq);

            indexes.push(Index {
                name,
                table: table.to_string(),
                columns: cols.into_iter().map(|(_, c)| c).collect(),
                is_unique: unique != 0,
            });
        }
        Ok(indexes)
    }
}

fn record_from_row(row: &SqliteRow) -> DbResult<MigrationRecord> {
    let executed_at: String = row.try_get("executed_at")?;
    let executed_at = DateTime::parse_from_rfc3339(&executed_at)
        .map_err(|e| DbError::new(format!("invalid executed_at '{}': {}", executed_at, e)))?
        .with_timezone(&Utc);

    Ok(MigrationRecord {
        version: row.try_get("version")?,
        description: row.try_get("description")?,
        rollback_sql: row.try_get("rollback_sql")?,
        risk_level: row.try_get("risk_level")?,
        executed_at,
    })
}

#[async_trait]
impl Database for SqliteDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        debug!("sqlite execute: {}", sql);
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn execute_in_transaction(
        &self,
        statements: &[String],
    ) -> Result<(), StatementFailure> {
        let mut tx = self.pool.begin().await.map_err(|e| StatementFailure {
            index: None,
            error: e.into(),
        })?;

        for (index, stmt) in statements.iter().enumerate() {
            debug!("sqlite tx[{}]: {}", index, stmt);
            let conn: &mut SqliteConnection = &mut tx;
            if let Err(e) = conn.execute(sqlx::raw_sql(stmt)).await {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Failed to roll back sqlite transaction: {}", rollback);
                }
                return Err(StatementFailure {
                    index: Some(index),
                    error: e.into(),
                });
            }
        }

        tx.commit().await.map_err(|e| StatementFailure {
            index: None,
            error: e.into(),
        })
    }

    async fn introspect(&self) -> DbResult<SchemaSnapshot> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tables = Vec::with_capacity(names.len());
        let mut indexes = Vec::new();
        for name in names {
            let columns = self.get_columns(&name).await?;
            indexes.extend(self.get_indexes(&name).await?);
            tables.push(Table { name, columns });
        }

        let snapshot = SchemaSnapshot::new(Dialect::Sqlite, tables, indexes);
        debug!(
            "Introspected sqlite schema with {} tables, {} indexes",
            snapshot.tables.len(),
            snapshot.indexes.len()
        );
        Ok(snapshot)
    }

    async fn create_history_table(&self, table: &str) -> DbResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                rollback_sql TEXT NOT NULL DEFAULT '',
                risk_level TEXT NOT NULL,
                executed_at TEXT NOT NULL
            )",
            quote_ident(Dialect::Sqlite, table)
        );
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_history(&self, table: &str, record: &MigrationRecord) -> DbResult<bool> {
        let sql = format!(
            "INSERT INTO {} (version, description, rollback_sql, risk_level, executed_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT (version) DO NOTHING",
            quote_ident(Dialect::Sqlite, table)
        );
        let result = sqlx::query(&sql)
            .bind(&record.version)
            .bind(&record.description)
            .bind(&record.rollback_sql)
            .bind(&record.risk_level)
            .bind(record.executed_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fetch_history(&self, table: &str, limit: usize) -> DbResult<Vec<MigrationRecord>> {
        let sql = format!(
            "SELECT version, description, rollback_sql, risk_level, executed_at \
             FROM {} ORDER BY id DESC LIMIT ?",
            quote_ident(Dialect::Sqlite, table)
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn find_history(&self, table: &str, version: &str) -> DbResult<Option<MigrationRecord>> {
        let sql = format!(
            "SELECT version, description, rollback_sql, risk_level, executed_at \
             FROM {} WHERE version = ?",
            quote_ident(Dialect::Sqlite, table)
        );
        let row = sqlx::query(&sql)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn delete_history(&self, table: &str, version: &str) -> DbResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE version = ?",
            quote_ident(Dialect::Sqlite, table)
        );
        let result = sqlx::query(&sql).bind(version).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_introspect_reflects_columns_and_explicit_indexes() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        db.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email VARCHAR(255) NOT NULL UNIQUE, age INTEGER DEFAULT 0);
             CREATE INDEX idx_users_age ON users (age);",
        )
        .await
        .unwrap();

        let snapshot = db.introspect().await.unwrap();
        let users = snapshot.get_table("users").unwrap();

        assert_eq!(users.columns.len(), 3);
        assert!(users.get_column("id").unwrap().is_primary_key);
        assert!(!users.get_column("email").unwrap().nullable);
        assert_eq!(users.get_column("email").unwrap().data_type, "VARCHAR(255)");
        assert_eq!(users.get_column("age").unwrap().default_value.as_deref(), Some("0"));

        // the UNIQUE constraint's autoindex is not reported
        assert_eq!(snapshot.indexes.len(), 1);
        assert_eq!(snapshot.indexes[0].name, "idx_users_age");
        assert_eq!(snapshot.indexes[0].columns, vec!["age".to_string()]);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_failure() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        let statements = vec![
            "CREATE TABLE a (x INTEGER)".to_string(),
            "CREATE TABLE a (x INTEGER)".to_string(),
        ];

        let failure = db.execute_in_transaction(&statements).await.unwrap_err();
        assert_eq!(failure.index, Some(1));

        let snapshot = db.introspect().await.unwrap();
        assert!(snapshot.get_table("a").is_none());
    }

    #[tokio::test]
    async fn test_history_insert_is_idempotent() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        db.create_history_table("_history").await.unwrap();

        let record = MigrationRecord {
            version: "v1".to_string(),
            description: "create users".to_string(),
            rollback_sql: "DROP TABLE users".to_string(),
            risk_level: "safe".to_string(),
            executed_at: Utc::now(),
        };

        assert!(db.insert_history("_history", &record).await.unwrap());
        assert!(!db.insert_history("_history", &record).await.unwrap());

        let rows = db.fetch_history("_history", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rollback_sql, "DROP TABLE users");
    }
}
