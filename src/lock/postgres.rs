//! PostgreSQL advisory lock provider
//!
//! Session-level advisory locks belong to the connection that took them, so
//! the pooled client is checked out for the whole hold and only returned to
//! the pool after `pg_advisory_unlock`.

use super::{Backoff, DistributedLock};
use crate::error::{DbError, MigrationError, Result};
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TRY_LOCK: &str = "SELECT pg_try_advisory_lock($1)";
const UNLOCK: &str = "SELECT pg_advisory_unlock($1)";

/// Terminate every other session holding the advisory key
const TERMINATE_HOLDERS: &str = r#"
    SELECT pg_terminate_backend(l.pid)
    FROM pg_locks l
    WHERE l.locktype = 'advisory'
        AND l.objsubid = 1
        AND l.granted
        AND ((l.classid::bigint << 32) | l.objid::bigint) = $1
        AND l.pid <> pg_backend_pid()
"#;

/// Acquisition counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisoryLockStats {
    pub hits: u64,
    pub misses: u64,
    pub timeouts: u64,
}

pub struct PostgresAdvisoryLock {
    pool: Pool,
    name: String,
    key: i64,
    held: Mutex<Option<Object>>,
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
}

impl PostgresAdvisoryLock {
    pub fn new(pool: Pool, name: &str) -> Self {
        Self {
            pool,
            name: name.to_string(),
            key: advisory_key(name),
            held: Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn stats(&self) -> AdvisoryLockStats {
        AdvisoryLockStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    fn lock_error(&self, err: impl Into<DbError>) -> MigrationError {
        MigrationError::LockAcquisition(format!(
            "advisory lock '{}' ({}): {}",
            self.name,
            self.key,
            err.into()
        ))
    }
}

/// Stable 64-bit key for a lock name: the first 8 bytes of its SHA-256
pub fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

#[async_trait]
impl DistributedLock for PostgresAdvisoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, timeout: Duration) -> Result<bool> {
        let mut held = self.held.lock().await;
        if held.is_some() {
            return Ok(true);
        }

        let client = self.pool.get().await.map_err(|e| self.lock_error(e))?;
        let mut backoff = Backoff::new(timeout);
        loop {
            let row = client
                .query_one(TRY_LOCK, &[&self.key])
                .await
                .map_err(|e| self.lock_error(e))?;
            let locked: bool = row.try_get(0).map_err(|e| self.lock_error(e))?;

            if locked {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Acquired advisory lock '{}' ({})", self.name, self.key);
                *held = Some(client);
                return Ok(true);
            }

            self.misses.fetch_add(1, Ordering::Relaxed);
            if !backoff.wait().await {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                info!("Timed out after {:?} waiting for advisory lock '{}'", timeout, self.name);
                return Ok(false);
            }
        }
    }

    async fn release(&self) -> Result<bool> {
        let Some(client) = self.held.lock().await.take() else {
            return Ok(false);
        };

        let row = client
            .query_one(UNLOCK, &[&self.key])
            .await
            .map_err(|e| self.lock_error(e))?;
        let unlocked: bool = row.try_get(0).map_err(|e| self.lock_error(e))?;
        if !unlocked {
            warn!("Advisory lock '{}' was not held by this session", self.name);
        }
        Ok(unlocked)
    }

    async fn force_release(&self) -> Result<bool> {
        let own = self.release().await?;

        let client = self.pool.get().await.map_err(|e| self.lock_error(e))?;
        let rows = client
            .query(TERMINATE_HOLDERS, &[&self.key])
            .await
            .map_err(|e| self.lock_error(e))?;
        let terminated = rows
            .iter()
            .filter(|row| row.try_get::<_, bool>(0).unwrap_or(false))
            .count();

        if terminated > 0 {
            warn!(
                "Force-released advisory lock '{}' by terminating {} session(s)",
                self.name, terminated
            );
        }
        Ok(own || terminated > 0)
    }
}
