//! Error handling module
//!
//! Provides the error taxonomy for the migration subsystem. Every variant can
//! produce a human-readable suggestion alongside its message.
//!
//! Driver errors are first wrapped in [`DbError`], which keeps the driver's
//! own error code (SQLSTATE for PostgreSQL, result code for SQLite) so that
//! classification can go through a structured code table. Message substring
//! matching is only a fallback and is best-effort by nature.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Migration subsystem error type
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    #[error("Schema detection failed: {message}")]
    SchemaDetection {
        message: String,
        timeout: Option<Duration>,
    },

    #[error("Migration execution failed: {message}")]
    MigrationExecution { message: String, cause: ErrorCause },

    #[error("Lock acquisition failed: {0}")]
    LockAcquisition(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Risk rule '{rule}' failed: {message}")]
    RiskAssessment { rule: String, message: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias for the migration subsystem
pub type Result<T> = std::result::Result<T, MigrationError>;

impl MigrationError {
    /// Wrap a driver error raised while running DDL
    pub fn execution(err: DbError) -> Self {
        let cause = err.cause();
        MigrationError::MigrationExecution {
            message: err.to_string(),
            cause,
        }
    }

    /// Wrap a driver error raised while reflecting the live schema
    pub fn detection(err: DbError) -> Self {
        if err.cause() == ErrorCause::Connection {
            return MigrationError::DatabaseConnection {
                message: err.to_string(),
            };
        }
        MigrationError::SchemaDetection {
            message: err.to_string(),
            timeout: None,
        }
    }

    /// Detection exceeded its configured ceiling
    pub fn detection_timeout(timeout: Duration) -> Self {
        MigrationError::SchemaDetection {
            message: format!("schema reflection did not finish within {:?}", timeout),
            timeout: Some(timeout),
        }
    }

    /// Wrap a driver error raised by the history table
    pub fn storage(err: DbError) -> Self {
        MigrationError::Storage(err.to_string())
    }

    /// Actionable hint shown next to the error message
    pub fn suggestion(&self) -> Option<String> {
        match self {
            MigrationError::DatabaseConnection { .. } => Some(
                "Check that the database is running, that DATABASE_URL points at it and that \
                 the network/firewall allows the connection"
                    .to_string(),
            ),
            MigrationError::SchemaDetection { timeout: Some(t), .. } => Some(format!(
                "Reflection took longer than {:?}; raise MIGRATION_DETECTION_TIMEOUT_SECS or \
                 check for long-running locks on the catalog",
                t
            )),
            MigrationError::SchemaDetection { .. } => Some(
                "Verify the connection user can read the system catalog \
                 (information_schema / sqlite_master)"
                    .to_string(),
            ),
            MigrationError::MigrationExecution { cause, .. } => Some(cause.suggestion().to_string()),
            MigrationError::LockAcquisition(_) => Some(
                "The lock backend itself failed; check the lock file directory permissions or \
                 the database connection used for advisory locks"
                    .to_string(),
            ),
            MigrationError::Storage(_) => Some(
                "Check that the history table exists and the connection user may write to it"
                    .to_string(),
            ),
            MigrationError::Cache(_) => Some(
                "The schema cache is optional; disable it with SCHEMA_CACHE=none if the backend \
                 is unavailable"
                    .to_string(),
            ),
            MigrationError::RiskAssessment { rule, .. } => {
                Some(format!("Fix or unregister the custom risk rule '{}'", rule))
            }
            MigrationError::Checkpoint(_) => Some(
                "Check that MIGRATION_CHECKPOINT_DIR exists and is writable".to_string(),
            ),
            MigrationError::Config(_) | MigrationError::Validation(_) => None,
        }
    }
}

// =============================================================================
// DRIVER ERRORS
// =============================================================================

/// A database driver error with its native error code preserved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub message: String,
    /// SQLSTATE (PostgreSQL) or extended result code (SQLite)
    pub code: Option<String>,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn cause(&self) -> ErrorCause {
        classify(self.code.as_deref(), &self.message)
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DbError {}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) => DbError::with_code(db.message(), code.into_owned()),
                None => DbError::new(db.message()),
            },
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                DbError::with_code(err.to_string(), SQLITE_CANTOPEN)
            }
            _ => DbError::new(err.to_string()),
        }
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db) = err.as_db_error() {
            return DbError::with_code(db.message(), db.code().code());
        }
        if err.is_closed() {
            return DbError::with_code(err.to_string(), "08006");
        }
        DbError::new(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for DbError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => DbError::from(e),
            other => DbError::with_code(format!("connection pool: {}", other), "08000"),
        }
    }
}

// =============================================================================
// CAUSE CLASSIFICATION
// =============================================================================

/// Detected root cause of a driver error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    Permission,
    MissingObject,
    Syntax,
    DuplicateObject,
    Constraint,
    Connection,
    Unknown,
}

impl ErrorCause {
    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorCause::Permission => {
                "The database user lacks DDL privileges; grant CREATE/ALTER on the schema or run \
                 migrations with an owner role"
            }
            ErrorCause::MissingObject => {
                "A referenced table or column does not exist; the live schema may have changed \
                 since detection, re-run auto_migrate"
            }
            ErrorCause::Syntax => {
                "The generated SQL was rejected by the server; check declared column types and \
                 defaults for dialect-specific syntax"
            }
            ErrorCause::DuplicateObject => {
                "The object already exists; another process may have applied this change, \
                 re-run detection"
            }
            ErrorCause::Constraint => {
                "Existing rows violate the new definition; backfill or clean the data before \
                 applying this change"
            }
            ErrorCause::Connection => {
                "The connection dropped mid-migration; check connectivity and inspect the \
                 schema before retrying"
            }
            ErrorCause::Unknown => "Inspect the driver message above and the generated SQL",
        }
    }
}

const SQLITE_CANTOPEN: &str = "14";

/// SQLSTATE codes (PostgreSQL/MySQL) mapped to causes
const SQLSTATE_CAUSES: &[(&str, ErrorCause)] = &[
    ("42501", ErrorCause::Permission),
    ("42P01", ErrorCause::MissingObject),
    ("42703", ErrorCause::MissingObject),
    ("42704", ErrorCause::MissingObject),
    ("42S02", ErrorCause::MissingObject),
    ("42S22", ErrorCause::MissingObject),
    ("42601", ErrorCause::Syntax),
    ("42000", ErrorCause::Syntax),
    ("42P07", ErrorCause::DuplicateObject),
    ("42701", ErrorCause::DuplicateObject),
    ("42710", ErrorCause::DuplicateObject),
    ("42S01", ErrorCause::DuplicateObject),
    ("23502", ErrorCause::Constraint),
    ("23503", ErrorCause::Constraint),
    ("23505", ErrorCause::Constraint),
    ("23514", ErrorCause::Constraint),
];

/// SQLite primary result codes mapped to causes
const SQLITE_CAUSES: &[(i64, ErrorCause)] = &[
    (3, ErrorCause::Permission),  // SQLITE_PERM
    (8, ErrorCause::Permission),  // SQLITE_READONLY
    (23, ErrorCause::Permission), // SQLITE_AUTH
    (14, ErrorCause::Connection), // SQLITE_CANTOPEN
    (26, ErrorCause::Connection), // SQLITE_NOTADB
    (19, ErrorCause::Constraint), // SQLITE_CONSTRAINT
];

/// Last-resort message heuristics, checked in order
const MESSAGE_CAUSES: &[(&str, ErrorCause)] = &[
    ("permission denied", ErrorCause::Permission),
    ("access denied", ErrorCause::Permission),
    ("not authorized", ErrorCause::Permission),
    ("must be owner", ErrorCause::Permission),
    ("no such table", ErrorCause::MissingObject),
    ("no such column", ErrorCause::MissingObject),
    ("unknown column", ErrorCause::MissingObject),
    ("does not exist", ErrorCause::MissingObject),
    ("doesn't exist", ErrorCause::MissingObject),
    ("syntax error", ErrorCause::Syntax),
    ("already exists", ErrorCause::DuplicateObject),
    ("duplicate column", ErrorCause::DuplicateObject),
    ("constraint failed", ErrorCause::Constraint),
    ("violates", ErrorCause::Constraint),
    ("connection refused", ErrorCause::Connection),
    ("could not connect", ErrorCause::Connection),
    ("connection reset", ErrorCause::Connection),
    ("broken pipe", ErrorCause::Connection),
];

/// Classify a driver error, preferring its native code over its message
pub fn classify(code: Option<&str>, message: &str) -> ErrorCause {
    if let Some(code) = code {
        if let Some((_, cause)) = SQLSTATE_CAUSES.iter().find(|(c, _)| *c == code) {
            return *cause;
        }
        if code.len() == 5 && (code.starts_with("08") || code.starts_with("57P")) {
            return ErrorCause::Connection;
        }
        if code.len() == 5 && code.starts_with("28") {
            return ErrorCause::Permission;
        }
        if let Ok(extended) = code.parse::<i64>() {
            // extended SQLite codes carry the primary code in the low byte
            let primary = extended & 0xff;
            if let Some((_, cause)) = SQLITE_CAUSES.iter().find(|(c, _)| *c == primary) {
                return *cause;
            }
        }
    }

    let lower = message.to_lowercase();
    MESSAGE_CAUSES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, cause)| *cause)
        .unwrap_or(ErrorCause::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_takes_priority_over_message() {
        // message says "does not exist" but the code says permission
        let cause = classify(Some("42501"), "relation does not exist");
        assert_eq!(cause, ErrorCause::Permission);
    }

    #[test]
    fn test_sqlstate_class_prefixes() {
        assert_eq!(classify(Some("08006"), ""), ErrorCause::Connection);
        assert_eq!(classify(Some("28P01"), ""), ErrorCause::Permission);
    }

    #[test]
    fn test_sqlite_extended_codes() {
        // SQLITE_CONSTRAINT_UNIQUE = 2067
        assert_eq!(classify(Some("2067"), "UNIQUE constraint failed"), ErrorCause::Constraint);
        assert_eq!(classify(Some("8"), "attempt to write a readonly database"), ErrorCause::Permission);
    }

    #[test]
    fn test_message_fallback() {
        assert_eq!(classify(Some("1"), "no such table: users"), ErrorCause::MissingObject);
        assert_eq!(classify(None, "near \"TABL\": syntax error"), ErrorCause::Syntax);
        assert_eq!(classify(None, "something odd"), ErrorCause::Unknown);
    }

    #[test]
    fn test_execution_error_suggestion_follows_cause() {
        let err = MigrationError::execution(DbError::with_code("permission denied for schema public", "42501"));
        let suggestion = err.suggestion().unwrap();
        assert!(suggestion.contains("privileges"));
    }

    #[test]
    fn test_detection_connection_error_maps_to_connection_variant() {
        let err = MigrationError::detection(DbError::with_code("server closed the connection", "08006"));
        assert!(matches!(err, MigrationError::DatabaseConnection { .. }));
    }
}
