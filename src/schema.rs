//! Declared schema metadata
//!
//! The target structure the application wants, as supplied by the ORM-model
//! layer. Can be built in code or loaded from a JSON document.

use crate::error::{MigrationError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_$]*$").expect("identifier regex"));

/// Check that a name is a plain SQL identifier
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(MigrationError::Validation(format!(
            "identifier '{}' must be 1-63 characters",
            name
        )));
    }
    if !IDENTIFIER.is_match(name) {
        return Err(MigrationError::Validation(format!(
            "identifier '{}' must start with a letter or underscore and contain only \
             alphanumerics, '_' or '$'",
            name
        )));
    }
    Ok(())
}

/// The full set of tables the application declares
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaMetadata {
    pub tables: Vec<TableDef>,
}

impl SchemaMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableDef) -> Self {
        self.tables.push(table);
        self
    }

    pub fn get_table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Load declared tables from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::Config(format!("cannot read schema file {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let metadata: SchemaMetadata = serde_json::from_str(raw)
            .map_err(|e| MigrationError::Config(format!("invalid schema document: {}", e)))?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Validate every identifier and reject duplicates
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            validate_identifier(&table.name)?;
            if !seen.insert(table.name.as_str()) {
                return Err(MigrationError::Validation(format!(
                    "table '{}' declared twice",
                    table.name
                )));
            }
            if table.columns.is_empty() {
                return Err(MigrationError::Validation(format!(
                    "table '{}' declares no columns",
                    table.name
                )));
            }
            let mut cols = std::collections::HashSet::new();
            for column in &table.columns {
                validate_identifier(&column.name)?;
                if !cols.insert(column.name.as_str()) {
                    return Err(MigrationError::Validation(format!(
                        "column '{}.{}' declared twice",
                        table.name, column.name
                    )));
                }
            }
            for index in &table.indexes {
                validate_identifier(&index.name)?;
                for col in &index.columns {
                    if !cols.contains(col.as_str()) {
                        return Err(MigrationError::Validation(format!(
                            "index '{}' references unknown column '{}.{}'",
                            index.name, table.name, col
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Stable hash of the declaration, used as the schema cache key
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Declared table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Declared column
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_default: Option<String>,
    #[serde(default)]
    pub is_primary_key: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default_value: None,
            server_default: None,
            is_primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn server_default(mut self, value: impl Into<String>) -> Self {
        self.server_default = Some(value.into());
        self
    }

    /// Default expression used in DDL, server default wins
    pub fn effective_default(&self) -> Option<&str> {
        self.server_default
            .as_deref()
            .or(self.default_value.as_deref())
    }

    pub fn has_default(&self) -> bool {
        self.effective_default().is_some()
    }
}

/// Declared index
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> SchemaMetadata {
        SchemaMetadata::new().table(
            TableDef::new("users")
                .column(ColumnDef::new("id", "INTEGER").primary_key())
                .column(ColumnDef::new("name", "VARCHAR(100)").not_null())
                .column(ColumnDef::new("age", "INTEGER"))
                .index(IndexDef::new("idx_users_name", &["name"])),
        )
    }

    #[test]
    fn test_builder_and_validation() {
        let schema = users();
        assert!(schema.validate().is_ok());
        assert!(!schema.get_table("users").unwrap().get_column("name").unwrap().nullable);
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        assert!(validate_identifier("users; DROP TABLE x").is_err());
        assert!(validate_identifier("1users").is_err());
        assert!(validate_identifier("_schemaflow_migrations").is_ok());
    }

    #[test]
    fn test_index_must_reference_declared_column() {
        let schema = SchemaMetadata::new().table(
            TableDef::new("t")
                .column(ColumnDef::new("a", "TEXT"))
                .index(IndexDef::new("idx_t_b", &["b"])),
        );
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_table_without_columns_is_rejected() {
        let schema = SchemaMetadata::new().table(TableDef::new("empty"));
        assert!(matches!(schema.validate(), Err(MigrationError::Validation(_))));
    }

    #[test]
    fn test_json_loading_defaults_to_nullable() {
        let raw = r#"{"tables":[{"name":"users","columns":[{"name":"id","dataType":"INTEGER","isPrimaryKey":true,"nullable":false},{"name":"bio","dataType":"TEXT"}]}]}"#;
        let schema = SchemaMetadata::from_json(raw).unwrap();
        let table = schema.get_table("users").unwrap();
        assert!(table.get_column("bio").unwrap().nullable);
        assert!(table.indexes.is_empty());
    }

    #[test]
    fn test_content_hash_is_stable_and_sensitive() {
        let a = users();
        assert_eq!(a.content_hash(), users().content_hash());

        let b = a.clone().table(TableDef::new("posts").column(ColumnDef::new("id", "INTEGER")));
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
