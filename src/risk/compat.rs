//! Column type compatibility
//!
//! Normalises dialect-specific type names to a canonical form and classifies
//! a type change through a lookup table.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How an existing value survives a type change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeCompatibility {
    /// Identical or widening; every value converts losslessly
    Safe,
    /// Narrowing but coercible; values may be truncated or rejected
    Compatible,
    Incompatible,
}

/// Dialect aliases mapped to a canonical type name
static ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("INT", "INTEGER"),
        ("INT4", "INTEGER"),
        ("MEDIUMINT", "INTEGER"),
        ("SERIAL", "INTEGER"),
        ("INT8", "BIGINT"),
        ("BIGSERIAL", "BIGINT"),
        ("INT2", "SMALLINT"),
        ("TINYINT", "SMALLINT"),
        ("SMALLSERIAL", "SMALLINT"),
        ("CHARACTER VARYING", "VARCHAR"),
        ("NVARCHAR", "VARCHAR"),
        ("VARCHAR2", "VARCHAR"),
        ("CHARACTER", "CHAR"),
        ("NCHAR", "CHAR"),
        ("BPCHAR", "CHAR"),
        ("CLOB", "TEXT"),
        ("MEDIUMTEXT", "TEXT"),
        ("LONGTEXT", "TEXT"),
        ("FLOAT4", "REAL"),
        ("FLOAT8", "DOUBLE"),
        ("FLOAT", "DOUBLE"),
        ("DOUBLE PRECISION", "DOUBLE"),
        ("DECIMAL", "NUMERIC"),
        ("BOOL", "BOOLEAN"),
        ("DATETIME", "TIMESTAMP"),
        ("TIMESTAMP WITHOUT TIME ZONE", "TIMESTAMP"),
        ("TIMESTAMP WITH TIME ZONE", "TIMESTAMPTZ"),
        ("TIME WITHOUT TIME ZONE", "TIME"),
        ("BYTEA", "BLOB"),
        ("LONGBLOB", "BLOB"),
    ])
});

/// Canonical (from, to) pairs; anything absent is incompatible
static COMPATIBILITY: Lazy<HashMap<(&'static str, &'static str), TypeCompatibility>> =
    Lazy::new(|| {
        use TypeCompatibility::*;
        HashMap::from([
            // integer widening
            (("SMALLINT", "INTEGER"), Safe),
            (("SMALLINT", "BIGINT"), Safe),
            (("INTEGER", "BIGINT"), Safe),
            (("SMALLINT", "NUMERIC"), Safe),
            (("INTEGER", "NUMERIC"), Safe),
            (("BIGINT", "NUMERIC"), Safe),
            (("INTEGER", "DOUBLE"), Safe),
            (("REAL", "DOUBLE"), Safe),
            // integer narrowing
            (("BIGINT", "INTEGER"), Compatible),
            (("BIGINT", "SMALLINT"), Compatible),
            (("INTEGER", "SMALLINT"), Compatible),
            (("NUMERIC", "INTEGER"), Compatible),
            (("NUMERIC", "BIGINT"), Compatible),
            (("DOUBLE", "REAL"), Compatible),
            (("DOUBLE", "NUMERIC"), Compatible),
            (("NUMERIC", "DOUBLE"), Compatible),
            (("BIGINT", "DOUBLE"), Compatible),
            // text
            (("CHAR", "VARCHAR"), Safe),
            (("CHAR", "TEXT"), Safe),
            (("VARCHAR", "TEXT"), Safe),
            (("TEXT", "VARCHAR"), Compatible),
            (("TEXT", "CHAR"), Compatible),
            (("VARCHAR", "CHAR"), Compatible),
            // anything renders as text
            (("SMALLINT", "TEXT"), Compatible),
            (("INTEGER", "TEXT"), Compatible),
            (("BIGINT", "TEXT"), Compatible),
            (("NUMERIC", "TEXT"), Compatible),
            (("BOOLEAN", "TEXT"), Compatible),
            (("INTEGER", "VARCHAR"), Compatible),
            (("BIGINT", "VARCHAR"), Compatible),
            (("JSON", "TEXT"), Compatible),
            (("JSONB", "TEXT"), Compatible),
            (("UUID", "TEXT"), Compatible),
            (("UUID", "VARCHAR"), Compatible),
            // temporal
            (("DATE", "TIMESTAMP"), Safe),
            (("DATE", "TIMESTAMPTZ"), Safe),
            (("TIMESTAMP", "TIMESTAMPTZ"), Safe),
            (("TIMESTAMPTZ", "TIMESTAMP"), Compatible),
            (("TIMESTAMP", "DATE"), Compatible),
            // misc
            (("JSON", "JSONB"), Compatible),
            (("JSONB", "JSON"), Safe),
            (("BOOLEAN", "INTEGER"), Compatible),
            (("BOOLEAN", "SMALLINT"), Compatible),
        ])
    });

/// Classifies column type changes
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeCompatibilityChecker;

impl TypeCompatibilityChecker {
    pub fn new() -> Self {
        Self
    }

    /// Canonical form of a type name
    ///
    /// Strips length/precision qualifiers, upper-cases, collapses whitespace
    /// and resolves dialect aliases: `character varying(255)` -> `VARCHAR`.
    pub fn normalize_type(data_type: &str) -> String {
        let mut stripped = String::with_capacity(data_type.len());
        let mut depth = 0usize;
        for ch in data_type.chars() {
            match ch {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ if depth == 0 => stripped.push(ch),
                _ => {}
            }
        }

        let collapsed = stripped
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase();

        ALIASES
            .get(collapsed.as_str())
            .map(|s| s.to_string())
            .unwrap_or(collapsed)
    }

    pub fn check_compatibility(&self, old_type: &str, new_type: &str) -> TypeCompatibility {
        let old = Self::normalize_type(old_type);
        let new = Self::normalize_type(new_type);
        if old == new {
            return TypeCompatibility::Safe;
        }
        COMPATIBILITY
            .get(&(old.as_str(), new.as_str()))
            .copied()
            .unwrap_or(TypeCompatibility::Incompatible)
    }

    /// Whether the type belongs to the integer family
    pub fn is_integer_type(data_type: &str) -> bool {
        matches!(
            Self::normalize_type(data_type).as_str(),
            "SMALLINT" | "INTEGER" | "BIGINT"
        )
    }
}
