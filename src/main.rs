//! SchemaFlow Migrate CLI
//!
//! Runs the auto-migration engine against `DATABASE_URL` using the schema
//! declared in `SCHEMA_FILE` (or `--schema`).
//!
//! ```bash
//! schemaflow-migrate migrate --mode safe
//! schemaflow-migrate plan
//! schemaflow-migrate rollback 1
//! schemaflow-migrate history --limit 20
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use schemaflow_migrate::schema::SchemaMetadata;
use schemaflow_migrate::{connect, MigrationEngine, MigrationMode, PlanStatus, Settings};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "schemaflow-migrate")]
#[command(about = "Detect schema drift and apply migrations safely", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Declared schema (JSON); overrides SCHEMA_FILE
    #[arg(short, long, global = true)]
    schema: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema changes
    Migrate {
        /// safe or aggressive; defaults to MIGRATION_MODE
        #[arg(short, long)]
        mode: Option<MigrationMode>,

        /// Version prefix for this run's history rows
        #[arg(long = "as-version")]
        version: Option<String>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show detected changes and their risk without applying them
    Plan,

    /// Undo the newest recorded migrations
    Rollback {
        #[arg(default_value_t = 1)]
        steps: usize,
    },

    /// List recorded migrations, newest first
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Release the migration lock regardless of its holder
    Unlock,

    /// List checkpoints left pending or failed by earlier runs
    Checkpoints,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!("❌ {:#}", e);
            if let Some(hint) = e
                .downcast_ref::<schemaflow_migrate::MigrationError>()
                .and_then(|m| m.suggestion())
            {
                error!("   Suggestion: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = Settings::load()?;
    info!("📋 Configuration loaded ({})", settings.database.redacted_url());

    let db = connect(&settings.database).await?;

    let schema_file = cli.schema.clone().or_else(|| settings.schema_file.clone());
    let needs_schema = matches!(cli.command, Commands::Migrate { .. } | Commands::Plan);
    let metadata = match (&schema_file, needs_schema) {
        (Some(path), _) => SchemaMetadata::from_json_file(path)
            .with_context(|| format!("loading schema from {}", path.display()))?,
        (None, false) => SchemaMetadata::new(),
        (None, true) => anyhow::bail!("no declared schema: set SCHEMA_FILE or pass --schema"),
    };

    let engine = MigrationEngine::from_settings(db, metadata, &settings)?;

    match cli.command {
        Commands::Migrate {
            mode,
            version,
            json,
        } => {
            let mode = mode.unwrap_or(settings.migration.mode);
            let plan = match version {
                Some(version) => engine.auto_migrate_versioned(mode, &version).await?,
                None => engine.auto_migrate(mode).await?,
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("{}", plan.summary());
            }

            Ok(match plan.status {
                PlanStatus::Failed => ExitCode::FAILURE,
                PlanStatus::Skipped => ExitCode::from(2),
                _ => ExitCode::SUCCESS,
            })
        }
        Commands::Plan => {
            let summary = engine.risk_summary().await?;
            println!(
                "{} change(s): {} safe, {} medium, {} high",
                summary.total, summary.safe, summary.medium, summary.high
            );
            for change in &summary.changes {
                println!("  [{}] {}", change.risk_level, change.description);
            }
            if summary.requires_confirmation() {
                warn!("Some changes need aggressive mode");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rollback { steps } => {
            let result = engine.rollback(steps).await?;
            println!("{}", result.message);
            for e in &result.errors {
                println!("  error: {}", e);
            }
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::History { limit } => {
            for record in engine.get_history(limit).await? {
                println!(
                    "{}  {:<6}  {}  {}",
                    record.executed_at.format("%Y-%m-%d %H:%M:%S"),
                    record.risk_level,
                    record.version,
                    record.description
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Unlock => {
            let released = engine.lock().force_release().await?;
            println!(
                "{}",
                if released {
                    "Lock released"
                } else {
                    "Lock was not held"
                }
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Checkpoints => {
            let Some(checkpoints) = engine.checkpoints() else {
                anyhow::bail!("checkpoints are disabled; set MIGRATION_CHECKPOINT_DIR");
            };
            let pending = checkpoints.get_pending_migrations().await?;
            let failed = checkpoints.get_failed_migrations().await?;
            for record in pending.iter().chain(failed.iter()) {
                println!(
                    "{}  {:<11}  {}%  {}",
                    record.migration_id,
                    record.status.to_string(),
                    record.progress,
                    record.error.as_deref().unwrap_or("")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Initialize tracing subscriber with environment filter
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schemaflow_migrate=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}
