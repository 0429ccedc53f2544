//! Database connection management
//!
//! The migration engine talks to the live database only through the
//! [`Database`] trait: execute DDL, run statement batches atomically, reflect
//! the current schema and read/write the history table.

pub mod postgres;
pub mod sqlite;

use crate::config::DatabaseConfig;
use crate::error::{DbError, MigrationError, Result};
use crate::introspection::SchemaSnapshot;
use crate::storage::MigrationRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub use postgres::PostgresDatabase;
pub use sqlite::SqliteDatabase;

/// Driver-level result
pub type DbResult<T> = std::result::Result<T, DbError>;

/// SQL dialect of a target database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
    Mysql,
}

impl Dialect {
    /// Detect dialect from a connection URL scheme
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?.to_ascii_lowercase();
        Self::from_name(&scheme)
    }

    /// Detect dialect from an engine/driver name
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.starts_with("postgres") {
            Some(Dialect::Postgres)
        } else if name.starts_with("sqlite") {
            Some(Dialect::Sqlite)
        } else if name.starts_with("mysql") || name.starts_with("mariadb") {
            Some(Dialect::Mysql)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgresql",
            Dialect::Mysql => "mysql",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A statement batch failed part-way through and was rolled back
#[derive(Debug, Clone)]
pub struct StatementFailure {
    /// Index of the failing statement; `None` if the transaction never started
    /// or failed to commit
    pub index: Option<usize>,
    pub error: DbError,
}

impl fmt::Display for StatementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "statement {} failed: {}", i + 1, self.error),
            None => write!(f, "transaction failed: {}", self.error),
        }
    }
}

/// Live database handle used by the migration subsystem
#[async_trait]
pub trait Database: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Round-trip check used at startup
    async fn ping(&self) -> DbResult<()>;

    /// Execute one or more statements outside an explicit transaction
    async fn execute_batch(&self, sql: &str) -> DbResult<()>;

    /// Execute statements atomically; everything is rolled back on failure
    async fn execute_in_transaction(
        &self,
        statements: &[String],
    ) -> std::result::Result<(), StatementFailure>;

    /// Reflect tables, columns and explicit indexes
    async fn introspect(&self) -> DbResult<SchemaSnapshot>;

    async fn create_history_table(&self, table: &str) -> DbResult<()>;

    /// Insert a history row; returns `false` when the version already exists
    async fn insert_history(&self, table: &str, record: &MigrationRecord) -> DbResult<bool>;

    /// Newest-first history rows
    async fn fetch_history(&self, table: &str, limit: usize) -> DbResult<Vec<MigrationRecord>>;

    async fn find_history(&self, table: &str, version: &str) -> DbResult<Option<MigrationRecord>>;

    async fn delete_history(&self, table: &str, version: &str) -> DbResult<u64>;

    /// Underlying PostgreSQL pool, used by the advisory lock provider
    fn postgres_pool(&self) -> Option<&deadpool_postgres::Pool> {
        None
    }
}

/// Open a database handle from configuration
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn Database>> {
    let dialect = Dialect::from_url(&config.url).ok_or_else(|| {
        MigrationError::Config(format!(
            "unsupported database URL '{}' (expected sqlite: or postgres://)",
            config.url
        ))
    })?;

    let db: Arc<dyn Database> = match dialect {
        Dialect::Sqlite => Arc::new(
            SqliteDatabase::connect(&config.url)
                .await
                .map_err(connection_error)?,
        ),
        Dialect::Postgres => Arc::new(
            PostgresDatabase::connect(&config.url, config.max_pool_size)
                .await
                .map_err(connection_error)?,
        ),
        Dialect::Mysql => {
            return Err(MigrationError::Config(
                "MySQL is supported by the risk rules only; no execution backend is available"
                    .to_string(),
            ))
        }
    };

    db.ping().await.map_err(connection_error)?;
    info!("✅ Connected to {} database", dialect);
    Ok(db)
}

fn connection_error(err: DbError) -> MigrationError {
    MigrationError::DatabaseConnection {
        message: err.to_string(),
    }
}

/// Split a SQL script into statements on `;`, ignoring semicolons inside
/// quoted strings and identifiers
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in sql.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None if ch == '\'' || ch == '"' || ch == '`' => quote = Some(ch),
            None if ch == ';' => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
                continue;
            }
            None => {}
        }
        current.push(ch);
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    statements
}
