//! In-process lock
//!
//! Clones share one mutex; separately constructed instances never contend.

use super::DistributedLock;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Clone)]
pub struct MemoryLock {
    name: String,
    inner: Arc<Mutex<()>>,
    guard: Arc<Mutex<Option<OwnedMutexGuard<()>>>>,
}

impl MemoryLock {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new(Mutex::new(())),
            guard: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.inner.clone().lock_owned()).await {
            Ok(owned) => {
                *self.guard.lock().await = Some(owned);
                debug!("Acquired memory lock '{}'", self.name);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn release(&self) -> Result<bool> {
        let released = self.guard.lock().await.take().is_some();
        if released {
            debug!("Released memory lock '{}'", self.name);
        }
        Ok(released)
    }

    async fn force_release(&self) -> Result<bool> {
        self.release().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_state() {
        let lock = MemoryLock::new("migrations");
        let other = lock.clone();

        assert!(lock.acquire(Duration::from_millis(50)).await.unwrap());
        assert!(other.is_locked());
        assert!(!other.acquire(Duration::from_millis(50)).await.unwrap());

        // any clone may release the shared hold
        assert!(other.release().await.unwrap());
        assert!(!lock.is_locked());
        assert!(other.acquire(Duration::from_millis(50)).await.unwrap());
    }

    #[tokio::test]
    async fn test_independent_instances_do_not_contend() {
        let a = MemoryLock::new("migrations");
        let b = MemoryLock::new("migrations");
        assert!(a.acquire(Duration::from_millis(50)).await.unwrap());
        assert!(b.acquire(Duration::from_millis(50)).await.unwrap());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let lock = MemoryLock::new("migrations");
        assert!(lock.acquire(Duration::from_millis(50)).await.unwrap());

        let waiter = lock.clone();
        let handle = tokio::spawn(async move { waiter.acquire(Duration::from_secs(2)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        lock.release().await.unwrap();
        assert!(handle.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_release_without_hold() {
        let lock = MemoryLock::new("migrations");
        assert!(!lock.release().await.unwrap());
        assert!(!lock.force_release().await.unwrap());
    }
}
