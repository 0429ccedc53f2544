//! Distributed locking
//!
//! Guarantees a single `auto_migrate`/`rollback` at a time. Acquisition
//! timing out is the normal "someone else is migrating" outcome and returns
//! `Ok(false)`; only a broken lock mechanism produces an error.

pub mod file;
pub mod memory;
pub mod postgres;

use crate::config::{LockBackend, LockSettings};
use crate::db::Database;
use crate::error::Result;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub use file::FileLock;
pub use memory::MemoryLock;
pub use postgres::{AdvisoryLockStats, PostgresAdvisoryLock};

#[async_trait]
pub trait DistributedLock: Send + Sync {
    fn name(&self) -> &str;

    /// Try to take the lock until `timeout` elapses
    async fn acquire(&self, timeout: Duration) -> Result<bool>;

    /// Release a lock held by this instance; `false` if it held nothing
    async fn release(&self) -> Result<bool>;

    /// Release regardless of the current holder
    async fn force_release(&self) -> Result<bool>;
}

// =============================================================================
// BACKOFF
// =============================================================================

const INITIAL_DELAY: Duration = Duration::from_millis(50);
const MAX_DELAY: Duration = Duration::from_secs(1);
const MAX_JITTER: f64 = 0.25;

/// Exponential polling schedule bounded by a deadline
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
    deadline: Instant,
}

impl Backoff {
    pub fn new(timeout: Duration) -> Self {
        Self {
            delay: INITIAL_DELAY,
            deadline: Instant::now() + timeout,
        }
    }

    /// Next sleep, or `None` once the deadline has passed
    pub fn next_delay(&mut self) -> Option<Duration> {
        let remaining = self.deadline.checked_duration_since(Instant::now())?;
        if remaining.is_zero() {
            return None;
        }

        let jitter = rand::thread_rng().gen_range(0.0..=MAX_JITTER);
        let delay = self.delay.mul_f64(1.0 + jitter).min(remaining);
        self.delay = (self.delay * 2).min(MAX_DELAY);
        Some(delay)
    }

    /// Sleep for the next delay; `false` when the deadline has passed
    pub async fn wait(&mut self) -> bool {
        match self.next_delay() {
            Some(delay) => {
                debug!("Lock busy, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                true
            }
            None => false,
        }
    }
}

/// Choose the lock provider for a database
pub fn select_lock(db: &Arc<dyn Database>, settings: &LockSettings) -> Arc<dyn DistributedLock> {
    match settings.backend {
        LockBackend::Memory => Arc::new(MemoryLock::new(&settings.name)),
        LockBackend::File => Arc::new(FileLock::new(&settings.path, settings.stale_after)),
        LockBackend::Auto => match db.postgres_pool() {
            Some(pool) => Arc::new(PostgresAdvisoryLock::new(pool.clone(), &settings.name)),
            None => Arc::new(FileLock::new(&settings.path, settings.stale_after)),
        },
    }
}
