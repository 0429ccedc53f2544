//! Schema Introspection Module
//!
//! Point-in-time view of the live database structure, as reflected by a
//! [`Database`](crate::db::Database) backend. This is the "live schema"
//! side of every diff.

use crate::db::Dialect;
use crate::schema::{ColumnDef, IndexDef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Complete schema snapshot at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub dialect: Dialect,
    pub captured_at: DateTime<Utc>,
    pub tables: Vec<Table>,
    pub indexes: Vec<Index>,
    pub checksum: String,
}

impl SchemaSnapshot {
    pub fn new(dialect: Dialect, tables: Vec<Table>, indexes: Vec<Index>) -> Self {
        let checksum = Self::compute_checksum(&tables, &indexes);
        Self {
            dialect,
            captured_at: Utc::now(),
            tables,
            indexes,
            checksum,
        }
    }

    /// Compute checksum from schema content
    pub fn compute_checksum(tables: &[Table], indexes: &[Index]) -> String {
        let mut hasher = Sha256::new();

        // Hash tables in sorted order for consistency
        let mut sorted: Vec<&Table> = tables.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        for table in sorted {
            hasher.update(table.name.as_bytes());
            for col in &table.columns {
                hasher.update(
                    format!(
                        "{}.{}:{}:{}:{:?}",
                        table.name, col.name, col.data_type, col.nullable, col.default_value
                    )
                    .as_bytes(),
                );
            }
        }

        let mut idx_strs: Vec<String> = indexes
            .iter()
            .map(|i| format!("IDX:{}.{}({}){}", i.table, i.name, i.columns.join(","), i.is_unique))
            .collect();
        idx_strs.sort();
        for s in &idx_strs {
            hasher.update(s.as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }

    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn indexes_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Index> + 'a {
        self.indexes.iter().filter(move |i| i.table == table)
    }
}

/// Table representation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Column representation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    pub is_primary_key: bool,
    pub ordinal_position: i32,
}

impl From<&Column> for ColumnDef {
    fn from(col: &Column) -> Self {
        ColumnDef {
            name: col.name.clone(),
            data_type: col.data_type.clone(),
            nullable: col.nullable,
            default_value: None,
            server_default: col.default_value.clone(),
            is_primary_key: col.is_primary_key,
        }
    }
}

/// Index representation
///
/// Only indexes created explicitly are reflected; indexes backing primary key
/// or unique constraints are owned by their table definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

impl From<&Index> for IndexDef {
    fn from(idx: &Index) -> Self {
        IndexDef {
            name: idx.name.clone(),
            columns: idx.columns.clone(),
            unique: idx.is_unique,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_table() -> Table {
        Table {
            name: "users".to_string(),
            columns: vec![Column {
                name: "id".to_string(),
                data_type: "integer".to_string(),
                nullable: false,
                default_value: None,
                is_primary_key: true,
                ordinal_position: 1,
            }],
        }
    }

    #[test]
    fn test_checksum_consistency() {
        let tables = vec![users_table()];

        let checksum1 = SchemaSnapshot::compute_checksum(&tables, &[]);
        let checksum2 = SchemaSnapshot::compute_checksum(&tables, &[]);

        assert_eq!(checksum1, checksum2);
    }

    #[test]
    fn test_checksum_ignores_table_order() {
        let posts = Table {
            name: "posts".to_string(),
            columns: vec![],
        };
        let a = SchemaSnapshot::compute_checksum(&[users_table(), posts.clone()], &[]);
        let b = SchemaSnapshot::compute_checksum(&[posts, users_table()], &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_checksum_sees_type_change() {
        let mut changed = users_table();
        changed.columns[0].data_type = "bigint".to_string();
        assert_ne!(
            SchemaSnapshot::compute_checksum(&[users_table()], &[]),
            SchemaSnapshot::compute_checksum(&[changed], &[])
        );
    }
}
