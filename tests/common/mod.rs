//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use schemaflow_migrate::db::SqliteDatabase;
use schemaflow_migrate::schema::{ColumnDef, SchemaMetadata, TableDef};
use schemaflow_migrate::Database;
use std::sync::Arc;

/// In-memory database, as both the concrete handle and the trait object
pub async fn sqlite() -> (Arc<SqliteDatabase>, Arc<dyn Database>) {
    let sqlite = Arc::new(SqliteDatabase::in_memory().await.unwrap());
    let db: Arc<dyn Database> = sqlite.clone();
    (sqlite, db)
}

pub fn users_model() -> SchemaMetadata {
    SchemaMetadata::new().table(
        TableDef::new("users")
            .column(ColumnDef::new("id", "INTEGER").primary_key())
            .column(ColumnDef::new("name", "VARCHAR(100)"))
            .column(ColumnDef::new("age", "INTEGER")),
    )
}

/// Declared type of a live column, as SQLite reports it
pub async fn column_type(db: &SqliteDatabase, table: &str, column: &str) -> Option<String> {
    let snapshot = db.introspect().await.unwrap();
    snapshot
        .get_table(table)?
        .get_column(column)
        .map(|c| c.data_type.clone())
}

pub async fn table_exists(db: &SqliteDatabase, table: &str) -> bool {
    db.introspect().await.unwrap().get_table(table).is_some()
}
