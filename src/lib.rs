//! SchemaFlow Migrate - automatic schema migrations
//!
//! Compares a declared schema with the live database, classifies every
//! difference by risk, applies what the chosen mode allows under a
//! distributed lock and records each applied change with its rollback SQL.
//!
//! ```no_run
//! use schemaflow_migrate::{connect, DatabaseConfig, MigrationEngine, MigrationMode};
//! use schemaflow_migrate::schema::{ColumnDef, SchemaMetadata, TableDef};
//!
//! # async fn run() -> schemaflow_migrate::Result<()> {
//! let db = connect(&DatabaseConfig::new("sqlite://app.db")).await?;
//! let metadata = SchemaMetadata::new().table(
//!     TableDef::new("users")
//!         .column(ColumnDef::new("id", "INTEGER").primary_key())
//!         .column(ColumnDef::new("name", "VARCHAR(100)")),
//! );
//! let engine = MigrationEngine::new(db, metadata)?;
//! let plan = engine.auto_migrate(MigrationMode::Safe).await?;
//! println!("{}", plan.summary());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod ddl;
pub mod detector;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod introspection;
pub mod lock;
pub mod rebuild;
pub mod risk;
pub mod schema;
pub mod storage;
pub mod types;

pub use config::{DatabaseConfig, Settings};
pub use db::{connect, Database, Dialect};
pub use detector::SchemaDetector;
pub use engine::MigrationEngine;
pub use error::{MigrationError, Result};
pub use hooks::{HookContext, HookOutcome, HookTrigger};
pub use lock::DistributedLock;
pub use risk::{AdvancedRiskAssessor, RiskLevel};
pub use storage::{MigrationRecord, MigrationStorage};
pub use types::{
    ChangeType, Migration, MigrationMode, MigrationPlan, OperationResult, PlanStatus,
    RollbackPolicy, SchemaChange,
};
