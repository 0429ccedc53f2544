//! DDL generator
//!
//! Renders dialect-specific DDL statements for every change the detector can
//! emit. Statements carry no trailing semicolon; callers join them as needed.

use crate::db::Dialect;
use crate::schema::{ColumnDef, IndexDef, TableDef};

/// Quote an identifier for the given dialect
pub fn quote_ident(dialect: Dialect, name: &str) -> String {
    match dialect {
        Dialect::Mysql => format!("`{}`", name.replace('`', "``")),
        Dialect::Sqlite | Dialect::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}

/// Generates DDL for one dialect
#[derive(Debug, Clone, Copy)]
pub struct DdlGenerator {
    dialect: Dialect,
}

impl DdlGenerator {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn q(&self, name: &str) -> String {
        quote_ident(self.dialect, name)
    }

    /// Column definition as it appears inside CREATE/ALTER TABLE
    pub fn column_definition(&self, col: &ColumnDef, inline_pk: bool) -> String {
        let mut def = format!("{} {}", self.q(&col.name), col.data_type);
        if col.is_primary_key && inline_pk {
            def.push_str(" PRIMARY KEY");
        }
        if !col.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = col.effective_default() {
            def.push_str(&format!(" DEFAULT {}", default));
        }
        def
    }

    pub fn create_table(&self, table: &TableDef) -> String {
        self.create_table_named(&table.name, &table.columns)
    }

    /// CREATE TABLE under an explicit name, used for shadow tables
    pub fn create_table_named(&self, name: &str, columns: &[ColumnDef]) -> String {
        let pk: Vec<&ColumnDef> = columns.iter().filter(|c| c.is_primary_key).collect();
        let inline_pk = pk.len() == 1;

        let mut parts: Vec<String> = columns
            .iter()
            .map(|col| format!("    {}", self.column_definition(col, inline_pk)))
            .collect();

        if pk.len() > 1 {
            let pk_cols: Vec<String> = pk.iter().map(|c| self.q(&c.name)).collect();
            parts.push(format!("    PRIMARY KEY ({})", pk_cols.join(", ")));
        }

        format!("CREATE TABLE {} (\n{}\n)", self.q(name), parts.join(",\n"))
    }

    pub fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE {}", self.q(table))
    }

    pub fn add_column(&self, table: &str, col: &ColumnDef) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.q(table),
            self.column_definition(col, true)
        )
    }

    pub fn drop_column(&self, table: &str, column: &str) -> String {
        format!("ALTER TABLE {} DROP COLUMN {}", self.q(table), self.q(column))
    }

    /// In-place type change; `None` on SQLite, which needs a table rebuild
    pub fn alter_column_type(&self, table: &str, col: &ColumnDef) -> Option<String> {
        match self.dialect {
            Dialect::Postgres => Some(format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                self.q(table),
                self.q(&col.name),
                col.data_type,
                self.q(&col.name),
                col.data_type
            )),
            Dialect::Mysql => Some(format!(
                "ALTER TABLE {} MODIFY COLUMN {}",
                self.q(table),
                self.column_definition(col, false)
            )),
            Dialect::Sqlite => None,
        }
    }

    pub fn create_index(&self, table: &str, index: &IndexDef) -> String {
        let cols: Vec<String> = index.columns.iter().map(|c| self.q(c)).collect();
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.q(&index.name),
            self.q(table),
            cols.join(", ")
        )
    }

    pub fn drop_index(&self, table: &str, index: &str) -> String {
        match self.dialect {
            Dialect::Mysql => format!("DROP INDEX {} ON {}", self.q(index), self.q(table)),
            Dialect::Sqlite | Dialect::Postgres => format!("DROP INDEX {}", self.q(index)),
        }
    }
}

/// Join statements into an executable script
pub fn script(statements: &[String]) -> String {
    statements
        .iter()
        .map(|s| format!("{};", s))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table_inline_primary_key() {
        let gen = DdlGenerator::new(Dialect::Sqlite);
        let table = TableDef::new("users")
            .column(ColumnDef::new("id", "INTEGER").primary_key())
            .column(ColumnDef::new("name", "VARCHAR(100)").not_null())
            .column(ColumnDef::new("age", "INTEGER").default_value("0"));

        let sql = gen.create_table(&table);
        assert!(sql.starts_with("CREATE TABLE \"users\" ("));
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY NOT NULL"));
        assert!(sql.contains("\"name\" VARCHAR(100) NOT NULL"));
        assert!(sql.contains("\"age\" INTEGER DEFAULT 0"));
    }

    #[test]
    fn test_composite_primary_key() {
        let gen = DdlGenerator::new(Dialect::Postgres);
        let sql = gen.create_table_named(
            "memberships",
            &[
                ColumnDef::new("user_id", "INTEGER").primary_key(),
                ColumnDef::new("group_id", "INTEGER").primary_key(),
            ],
        );
        assert!(sql.contains("PRIMARY KEY (\"user_id\", \"group_id\")"));
        assert!(!sql.contains("INTEGER PRIMARY KEY"));
    }

    #[test]
    fn test_alter_column_type_per_dialect() {
        let col = ColumnDef::new("age", "BIGINT");
        let pg = DdlGenerator::new(Dialect::Postgres).alter_column_type("users", &col);
        assert_eq!(
            pg.as_deref(),
            Some("ALTER TABLE \"users\" ALTER COLUMN \"age\" TYPE BIGINT USING \"age\"::BIGINT")
        );

        let my = DdlGenerator::new(Dialect::Mysql).alter_column_type("users", &col);
        assert_eq!(my.as_deref(), Some("ALTER TABLE `users` MODIFY COLUMN `age` BIGINT"));

        assert!(DdlGenerator::new(Dialect::Sqlite)
            .alter_column_type("users", &col)
            .is_none());
    }

    #[test]
    fn test_index_statements() {
        let gen = DdlGenerator::new(Dialect::Mysql);
        let idx = IndexDef::new("idx_users_email", &["email"]).unique();
        assert_eq!(
            gen.create_index("users", &idx),
            "CREATE UNIQUE INDEX `idx_users_email` ON `users` (`email`)"
        );
        assert_eq!(
            gen.drop_index("users", "idx_users_email"),
            "DROP INDEX `idx_users_email` ON `users`"
        );
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident(Dialect::Postgres, "we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_ident(Dialect::Mysql, "we`ird"), "`we``ird`");
    }
}
