//! Lock file provider
//!
//! An `fs2` exclusive lock on a well-known file. The file body records the
//! holder as `"{pid}:{acquired_at_unix}"` so that a waiter can recognise a
//! lock left behind by a process that no longer exists.

use super::{Backoff, DistributedLock};
use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct FileLock {
    path: PathBuf,
    name: String,
    stale_after: Duration,
    held: Mutex<Option<File>>,
}

impl FileLock {
    pub fn new(path: &Path, stale_after: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            name: path.display().to_string(),
            stale_after,
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
    }

    /// One non-blocking attempt; `None` when another handle holds the lock
    fn try_take(&self) -> Result<Option<File>> {
        let mut file = self.open().map_err(|e| self.io_error("open", e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => return Ok(None),
            Err(e) => return Err(self.io_error("lock", e)),
        }

        let body = format!("{}:{}", std::process::id(), unix_now());
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(body.as_bytes()))
            .and_then(|_| file.sync_data())
            .map_err(|e| self.io_error("write", e))?;

        Ok(Some(file))
    }

    fn read_body(&self) -> Option<String> {
        let mut body = String::new();
        File::open(&self.path)
            .and_then(|mut f| f.read_to_string(&mut body))
            .ok()?;
        Some(body)
    }

    /// Body of the current holder when it looks abandoned
    ///
    /// An empty body is never stale: the OS lock is held and the holder has
    /// not written its body yet. A dead process holds no OS lock at all.
    fn stale_body(&self) -> Option<String> {
        let body = self.read_body()?;
        if body.trim().is_empty() {
            return None;
        }

        let stale = match parse_body(&body) {
            Some((pid, acquired_at)) => {
                let age = unix_now().saturating_sub(acquired_at);
                age >= self.stale_after.as_secs() && !pid_alive(pid)
            }
            None => self.mtime_age().is_some_and(|age| age >= self.stale_after),
        };
        stale.then_some(body)
    }

    /// Unlink the lock file only if it still carries `judged`
    fn remove_if_unchanged(&self, judged: &str) -> Result<bool> {
        if self.read_body().as_deref() != Some(judged) {
            debug!("Lock file {} changed hands, not removing", self.path.display());
            return Ok(false);
        }
        self.remove()
    }

    fn mtime_age(&self) -> Option<Duration> {
        let modified = std::fs::metadata(&self.path).ok()?.modified().ok()?;
        SystemTime::now().duration_since(modified).ok()
    }

    fn remove(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error("remove", e)),
        }
    }

    fn io_error(&self, op: &str, err: std::io::Error) -> MigrationError {
        MigrationError::LockAcquisition(format!(
            "lock file {} ({}): {}",
            self.path.display(),
            op,
            err
        ))
    }
}

#[async_trait]
impl DistributedLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, timeout: Duration) -> Result<bool> {
        let mut held = self.held.lock().await;
        if held.is_some() {
            return Ok(true);
        }

        let mut backoff = Backoff::new(timeout);
        loop {
            if let Some(file) = self.try_take()? {
                *held = Some(file);
                debug!("Acquired lock file {}", self.path.display());
                return Ok(true);
            }

            if let Some(body) = self.stale_body() {
                warn!(
                    "Lock file {} is stale (holder gone for over {:?}), forcing release",
                    self.path.display(),
                    self.stale_after
                );
                if self.remove_if_unchanged(&body)? {
                    continue;
                }
            }

            if !backoff.wait().await {
                info!("Timed out after {:?} waiting for lock file {}", timeout, self.path.display());
                return Ok(false);
            }
        }
    }

    async fn release(&self) -> Result<bool> {
        let Some(file) = self.held.lock().await.take() else {
            return Ok(false);
        };

        // keep the file so waiters never lock an unlinked inode
        file.set_len(0).map_err(|e| self.io_error("truncate", e))?;
        FileExt::unlock(&file).map_err(|e| self.io_error("unlock", e))?;
        debug!("Released lock file {}", self.path.display());
        Ok(true)
    }

    async fn force_release(&self) -> Result<bool> {
        if self.release().await? {
            return Ok(true);
        }
        let removed = self.remove()?;
        if removed {
            warn!("Force-released lock file {}", self.path.display());
        }
        Ok(removed)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parse_body(body: &str) -> Option<(i32, u64)> {
    let (pid, at) = body.trim().split_once(':')?;
    let pid: i32 = pid.parse().ok()?;
    if pid <= 0 {
        return None;
    }
    Some((pid, at.parse().ok()?))
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid), None::<Signal>) {
        Ok(()) => true,
        // exists but belongs to another user
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body("123:1700000000"), Some((123, 1_700_000_000)));
        assert_eq!(parse_body(" 7:1\n"), Some((7, 1)));
        assert_eq!(parse_body("garbage"), None);
        assert_eq!(parse_body("0:1"), None);
        assert_eq!(parse_body(""), None);
    }

    #[tokio::test]
    async fn test_mutual_exclusion_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");
        let first = FileLock::new(&path, Duration::from_secs(300));
        let second = FileLock::new(&path, Duration::from_secs(300));

        assert!(first.acquire(Duration::from_millis(100)).await.unwrap());
        assert!(!second.acquire(Duration::from_millis(150)).await.unwrap());

        assert!(first.release().await.unwrap());
        assert!(path.exists());
        assert!(second.acquire(Duration::from_millis(100)).await.unwrap());
        assert!(second.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_body_records_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");
        let lock = FileLock::new(&path, Duration::from_secs(300));

        assert!(lock.acquire(Duration::from_millis(100)).await.unwrap());
        let body = std::fs::read_to_string(&path).unwrap();
        let (pid, _) = parse_body(&body).unwrap();
        assert_eq!(pid as u32, std::process::id());

        lock.release().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn test_release_without_hold() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(&dir.path().join("app.lock"), Duration::from_secs(300));
        assert!(!lock.release().await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_holder_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");

        // a handle that holds the OS lock but claims a long-dead owner
        let mut orphan = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        orphan.try_lock_exclusive().unwrap();
        let old = unix_now() - 3600;
        write!(orphan, "{}:{}", i32::MAX - 1, old).unwrap();
        orphan.sync_data().unwrap();

        let lock = FileLock::new(&path, Duration::from_secs(10));
        assert!(lock.acquire(Duration::from_secs(1)).await.unwrap());

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(parse_body(&body).unwrap().0 as u32, std::process::id());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_holder_with_empty_body_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");

        // OS lock taken, body not written yet, file untouched for an hour
        let holder = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        holder.try_lock_exclusive().unwrap();
        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        holder.set_modified(an_hour_ago).unwrap();

        let waiter = FileLock::new(&path, Duration::from_secs(10));
        assert!(waiter.stale_body().is_none());
        assert!(!waiter.acquire(Duration::from_millis(300)).await.unwrap());
        assert!(path.exists());

        FileExt::unlock(&holder).unwrap();
    }

    #[test]
    fn test_stale_file_is_kept_when_body_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");
        std::fs::write(&path, "4242:1").unwrap();
        let lock = FileLock::new(&path, Duration::from_secs(10));

        // another waiter already replaced the file with a fresh holder
        let fresh = format!("{}:{}", std::process::id(), unix_now());
        std::fs::write(&path, &fresh).unwrap();
        assert!(!lock.remove_if_unchanged("4242:1").unwrap());
        assert!(path.exists());

        assert!(lock.remove_if_unchanged(&fresh).unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_live_holder_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");
        let holder = FileLock::new(&path, Duration::from_secs(0));
        let waiter = FileLock::new(&path, Duration::from_secs(0));

        assert!(holder.acquire(Duration::from_millis(100)).await.unwrap());
        // our own pid is alive, so even a zero threshold keeps the lock
        assert!(!waiter.acquire(Duration::from_millis(150)).await.unwrap());
        holder.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_force_release_removes_foreign_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");
        let holder = FileLock::new(&path, Duration::from_secs(300));
        let admin = FileLock::new(&path, Duration::from_secs(300));

        assert!(holder.acquire(Duration::from_millis(100)).await.unwrap());
        assert!(admin.force_release().await.unwrap());
        assert!(!path.exists());
        assert!(admin.acquire(Duration::from_millis(100)).await.unwrap());
        admin.release().await.unwrap();
    }
}
