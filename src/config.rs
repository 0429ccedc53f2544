//! Configuration module
//!
//! Loads migration settings from the environment (and `.env`). Every value
//! has a default except `DATABASE_URL`.

use crate::error::MigrationError;
use crate::schema::validate_identifier;
use crate::types::{MigrationMode, RollbackPolicy};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HISTORY_TABLE: &str = "_schemaflow_migrations";
pub const DEFAULT_APP_NAME: &str = "schemaflow";
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STALE_SECS: u64 = 300;
const TEST_STALE_SECS: u64 = 10;
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load environment variables: {0}")]
    EnvLoad(#[from] dotenvy::Error),

    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl From<ConfigError> for MigrationError {
    fn from(err: ConfigError) -> Self {
        MigrationError::Config(err.to_string())
    }
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_pool_size: usize,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_pool_size: 10,
        }
    }

    /// URL with the password masked, for logging
    pub fn redacted_url(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(mut parsed) if parsed.password().is_some() => {
                let _ = parsed.set_password(Some("***"));
                parsed.to_string()
            }
            _ => self.url.clone(),
        }
    }
}

/// Which lock provider guards a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockBackend {
    /// Advisory lock on PostgreSQL, lock file otherwise
    #[default]
    Auto,
    File,
    /// Process-local; only for tests and single-process tools
    Memory,
}

impl FromStr for LockBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(LockBackend::Auto),
            "file" => Ok(LockBackend::File),
            "memory" => Ok(LockBackend::Memory),
            other => Err(ConfigError::InvalidValue(format!(
                "MIGRATION_LOCK_BACKEND must be auto, file or memory, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub backend: LockBackend,
    /// Lock name; also the advisory lock key source
    pub name: String,
    pub path: PathBuf,
    pub timeout: Duration,
    /// Age after which a dead holder's lock file is reclaimed
    pub stale_after: Duration,
}

#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub app_name: String,
    pub mode: MigrationMode,
    pub history_table: String,
    pub environment: String,
    pub detection_timeout: Option<Duration>,
    pub rollback_policy: RollbackPolicy,
    pub checkpoint_dir: Option<PathBuf>,
    pub ignore_tables: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackend {
    #[default]
    None,
    File,
    Redis,
}

impl FromStr for CacheBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(CacheBackend::None),
            "file" => Ok(CacheBackend::File),
            "redis" => Ok(CacheBackend::Redis),
            other => Err(ConfigError::InvalidValue(format!(
                "SCHEMA_CACHE must be none, file or redis, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: CacheBackend,
    pub path: PathBuf,
    pub redis_url: Option<String>,
    pub ttl: Duration,
    pub key_prefix: String,
}

/// Complete settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub migration: MigrationSettings,
    pub lock: LockSettings,
    pub cache: CacheSettings,
    /// JSON document with the declared schema
    pub schema_file: Option<PathBuf>,
}

impl Settings {
    /// Load settings from `.env` and the process environment
    pub fn load() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(ConfigError::EnvLoad(e)),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database = DatabaseConfig {
            url: get("DATABASE_URL")
                .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?,
            max_pool_size: parse_or(&get, "DB_MAX_CONNECTIONS", 10usize)?,
        };

        let app_name = get("MIGRATION_APP_NAME").unwrap_or_else(|| DEFAULT_APP_NAME.to_string());
        let environment = get("MIGRATION_ENV").unwrap_or_else(|| "production".to_string());

        let history_table =
            get("MIGRATION_HISTORY_TABLE").unwrap_or_else(|| DEFAULT_HISTORY_TABLE.to_string());
        validate_identifier(&history_table)
            .map_err(|e| ConfigError::InvalidValue(format!("MIGRATION_HISTORY_TABLE: {}", e)))?;

        let mode = match get("MIGRATION_MODE") {
            Some(raw) => raw.parse::<MigrationMode>().map_err(ConfigError::InvalidValue)?,
            None => MigrationMode::default(),
        };
        let rollback_policy = match get("MIGRATION_ROLLBACK_POLICY") {
            Some(raw) => raw.parse::<RollbackPolicy>().map_err(ConfigError::InvalidValue)?,
            None => RollbackPolicy::default(),
        };

        let stale_default = if environment.eq_ignore_ascii_case("test") {
            TEST_STALE_SECS
        } else {
            DEFAULT_STALE_SECS
        };

        let lock = LockSettings {
            backend: match get("MIGRATION_LOCK_BACKEND") {
                Some(raw) => raw.parse()?,
                None => LockBackend::default(),
            },
            name: format!("{}_migration", app_name),
            path: get("MIGRATION_LOCK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(format!(".{}_migration.lock", app_name))),
            timeout: Duration::from_secs(parse_or(
                &get,
                "MIGRATION_LOCK_TIMEOUT_SECS",
                DEFAULT_LOCK_TIMEOUT_SECS,
            )?),
            stale_after: Duration::from_secs(parse_or(
                &get,
                "MIGRATION_LOCK_STALE_SECS",
                stale_default,
            )?),
        };

        let detection_timeout = match get("MIGRATION_DETECTION_TIMEOUT_SECS") {
            Some(raw) => Some(Duration::from_secs(parse_value(
                "MIGRATION_DETECTION_TIMEOUT_SECS",
                &raw,
            )?)),
            None => None,
        };

        let ignore_tables = get("MIGRATION_IGNORE_TABLES")
            .map(|s| {
                s.split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let cache_backend: CacheBackend = match get("SCHEMA_CACHE") {
            Some(raw) => raw.parse()?,
            None => CacheBackend::default(),
        };
        let redis_url = get("REDIS_URL");
        if cache_backend == CacheBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::MissingVar(
                "REDIS_URL (required when SCHEMA_CACHE=redis)".to_string(),
            ));
        }

        let cache = CacheSettings {
            backend: cache_backend,
            path: get("SCHEMA_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(format!(".{}_schema_cache.json", app_name))),
            redis_url,
            ttl: Duration::from_secs(parse_or(&get, "SCHEMA_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)?),
            key_prefix: format!("{}:schema", app_name),
        };

        let migration = MigrationSettings {
            app_name,
            mode,
            history_table,
            environment,
            detection_timeout,
            rollback_policy,
            checkpoint_dir: get("MIGRATION_CHECKPOINT_DIR").map(PathBuf::from),
            ignore_tables,
        };

        Ok(Self {
            database,
            migration,
            lock,
            cache,
            schema_file: get("SCHEMA_FILE").map(PathBuf::from),
        })
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{} has invalid value '{}'", key, raw)))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}
