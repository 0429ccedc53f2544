//! PostgreSQL backend
//!
//! Pooled through deadpool-postgres. TLS is negotiated with rustls when the
//! host is a managed provider (Neon) or `sslmode=require` is present.

use super::{Database, DbResult, Dialect, StatementFailure};
use crate::ddl::quote_ident;
use crate::error::DbError;
use crate::introspection::{Column, Index, SchemaSnapshot, Table};
use crate::storage::MigrationRecord;
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tracing::{debug, info, warn};

/// Columns of every user table in the target schema
const GET_COLUMNS: &str = r#"
    SELECT
        c.relname AS table_name,
        a.attname AS column_name,
        pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
        NOT a.attnotnull AS nullable,
        pg_catalog.pg_get_expr(d.adbin, d.adrelid) AS column_default,
        COALESCE(pk.is_pk, false) AS is_primary_key,
        a.attnum::int4 AS ordinal_position
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid
    LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = c.oid AND d.adnum = a.attnum
    LEFT JOIN (
        SELECT ix.indrelid, unnest(ix.indkey) AS attnum, true AS is_pk
        FROM pg_catalog.pg_index ix
        WHERE ix.indisprimary
    ) pk ON pk.indrelid = c.oid AND pk.attnum = a.attnum
    WHERE n.nspname = $1
        AND c.relkind IN ('r', 'p')
        AND a.attnum > 0
        AND NOT a.attisdropped
    ORDER BY c.relname, a.attnum
"#;

/// Explicit indexes; primary keys and constraint-backed indexes are skipped
const GET_INDEXES: &str = r#"
    SELECT
        i.relname AS index_name,
        t.relname AS table_name,
        COALESCE(array_agg(a.attname::text ORDER BY array_position(ix.indkey, a.attnum)), ARRAY[]::text[]) AS columns,
        ix.indisunique AS is_unique
    FROM pg_class t
    JOIN pg_index ix ON t.oid = ix.indrelid
    JOIN pg_class i ON i.oid = ix.indexrelid
    JOIN pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
    WHERE n.nspname = $1
        AND t.relkind = 'r'
        AND NOT ix.indisprimary
        AND NOT EXISTS (SELECT 1 FROM pg_constraint con WHERE con.conindid = ix.indexrelid)
    GROUP BY i.relname, t.relname, ix.indisunique
    ORDER BY t.relname, i.relname
"#;

pub struct PostgresDatabase {
    pool: Pool,
    schema: String,
}

impl PostgresDatabase {
    /// Build a pool from a `postgres://` URL and verify it with a round-trip
    pub async fn connect(database_url: &str, max_pool_size: usize) -> DbResult<Self> {
        let config = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| DbError::new(format!("Failed to parse DATABASE_URL: {}", e)))?;

        let host = match config.get_hosts().first() {
            Some(tokio_postgres::config::Host::Tcp(s)) => s.clone(),
            Some(tokio_postgres::config::Host::Unix(_)) => {
                return Err(DbError::new("Unix socket connections are not supported"));
            }
            None => return Err(DbError::new("No host in DATABASE_URL")),
        };
        let port = config.get_ports().first().copied().unwrap_or(5432);
        let user = config
            .get_user()
            .map(|u| u.to_string())
            .ok_or_else(|| DbError::new("No user in DATABASE_URL"))?;
        let password = config
            .get_password()
            .map(|p| String::from_utf8_lossy(p).to_string())
            .unwrap_or_default();
        let dbname = config
            .get_dbname()
            .map(|db| db.to_string())
            .ok_or_else(|| DbError::new("No database name in DATABASE_URL"))?;

        let use_tls = host.contains("neon.tech") || database_url.contains("sslmode=require");

        let mut cfg = Config::new();
        cfg.host = Some(host);
        cfg.port = Some(port);
        cfg.user = Some(user);
        cfg.password = Some(password);
        cfg.dbname = Some(dbname);
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(max_pool_size.max(1)));

        let pool = if use_tls {
            let certs = rustls_native_certs::load_native_certs();
            let mut root_store = rustls::RootCertStore::empty();
            for cert in certs.certs {
                root_store.add(cert).ok();
            }
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

            cfg.create_pool(Some(Runtime::Tokio1), tls)
                .map_err(|e| DbError::new(format!("Failed to create TLS pool: {}", e)))?
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
                .map_err(|e| DbError::new(format!("Failed to create pool: {}", e)))?
        };

        info!("✅ PostgreSQL pool created (TLS: {})", use_tls);
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            schema: "public".to_string(),
        }
    }

    /// Reflect a schema other than `public`
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    fn qualified(&self, table: &str) -> String {
        format!(
            "{}.{}",
            quote_ident(Dialect::Postgres, &self.schema),
            quote_ident(Dialect::Postgres, table)
        )
    }
}

fn record_from_row(row: &tokio_postgres::Row) -> DbResult<MigrationRecord> {
    Ok(MigrationRecord {
        version: row.try_get("version")?,
        description: row.try_get("description")?,
        rollback_sql: row.try_get("rollback_sql")?,
        risk_level: row.try_get("risk_level")?,
        executed_at: row.try_get("executed_at")?,
    })
}

#[async_trait]
impl Database for PostgresDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn ping(&self) -> DbResult<()> {
        let client = self.pool.get().await?;
        client.query_one("SELECT 1 as ok", &[]).await?;
        Ok(())
    }

    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        debug!("postgres execute: {}", sql);
        let client = self.pool.get().await?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    async fn execute_in_transaction(
        &self,
        statements: &[String],
    ) -> Result<(), StatementFailure> {
        let mut client = self.pool.get().await.map_err(|e| StatementFailure {
            index: None,
            error: e.into(),
        })?;
        let tx = client.transaction().await.map_err(|e| StatementFailure {
            index: None,
            error: e.into(),
        })?;

        for (index, stmt) in statements.iter().enumerate() {
            debug!("postgres tx[{}]: {}", index, stmt);
            if let Err(e) = tx.batch_execute(stmt).await {
                let error = DbError::from(e);
                // dropping the transaction rolls it back as well
                if let Err(rollback) = tx.rollback().await {
                    warn!("Failed to roll back postgres transaction: {}", rollback);
                }
                return Err(StatementFailure {
                    index: Some(index),
                    error,
                });
            }
        }

        tx.commit().await.map_err(|e| StatementFailure {
            index: None,
            error: e.into(),
        })
    }

    async fn introspect(&self) -> DbResult<SchemaSnapshot> {
        let client = self.pool.get().await?;

        let mut tables: Vec<Table> = Vec::new();
        for row in client.query(GET_COLUMNS, &[&self.schema]).await? {
            let table_name: String = row.try_get("table_name")?;
            let column = Column {
                name: row.try_get("column_name")?,
                data_type: row.try_get("data_type")?,
                nullable: row.try_get("nullable")?,
                default_value: row.try_get("column_default")?,
                is_primary_key: row.try_get("is_primary_key")?,
                ordinal_position: row.try_get("ordinal_position")?,
            };
            match tables.last_mut() {
                Some(t) if t.name == table_name => t.columns.push(column),
                _ => tables.push(Table {
                    name: table_name,
                    columns: vec![column],
                }),
            }
        }

        let indexes = client
            .query(GET_INDEXES, &[&self.schema])
            .await?
            .iter()
            .map(|row| {
                Ok(Index {
                    name: row.try_get("index_name")?,
                    table: row.try_get("table_name")?,
                    columns: row.try_get("columns")?,
                    is_unique: row.try_get("is_unique")?,
                })
            })
            .collect::<Result<Vec<_>, tokio_postgres::Error>>()?;

        let snapshot = SchemaSnapshot::new(Dialect::Postgres, tables, indexes);
        debug!(
            "Introspected postgres schema '{}' with {} tables, {} indexes",
            self.schema,
            snapshot.tables.len(),
            snapshot.indexes.len()
        );
        Ok(snapshot)
    }

    async fn create_history_table(&self, table: &str) -> DbResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                version VARCHAR(255) NOT NULL UNIQUE,
                description TEXT NOT NULL,
                rollback_sql TEXT NOT NULL DEFAULT '',
                risk_level VARCHAR(16) NOT NULL,
                executed_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            self.qualified(table)
        );
        self.execute_batch(&sql).await
    }

    async fn insert_history(&self, table: &str, record: &MigrationRecord) -> DbResult<bool> {
        let sql = format!(
            "INSERT INTO {} (version, description, rollback_sql, risk_level, executed_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (version) DO NOTHING",
            self.qualified(table)
        );
        let client = self.pool.get().await?;
        let inserted = client
            .execute(
                &sql,
                &[
                    &record.version,
                    &record.description,
                    &record.rollback_sql,
                    &record.risk_level,
                    &record.executed_at,
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn fetch_history(&self, table: &str, limit: usize) -> DbResult<Vec<MigrationRecord>> {
        let sql = format!(
            "SELECT version, description, rollback_sql, risk_level, executed_at \
             FROM {} ORDER BY id DESC LIMIT $1",
            self.qualified(table)
        );
        let client = self.pool.get().await?;
        let rows = client.query(&sql, &[&(limit as i64)]).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn find_history(&self, table: &str, version: &str) -> DbResult<Option<MigrationRecord>> {
        let sql = format!(
            "SELECT version, description, rollback_sql, risk_level, executed_at \
             FROM {} WHERE version = $1",
            self.qualified(table)
        );
        let client = self.pool.get().await?;
        let row = client.query_opt(&sql, &[&version]).await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn delete_history(&self, table: &str, version: &str) -> DbResult<u64> {
        let sql = format!("DELETE FROM {} WHERE version = $1", self.qualified(table));
        let client = self.pool.get().await?;
        Ok(client.execute(&sql, &[&version]).await?)
    }

    fn postgres_pool(&self) -> Option<&Pool> {
        Some(&self.pool)
    }
}
