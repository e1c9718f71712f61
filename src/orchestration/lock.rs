//! Filesystem execution lock: `<root>/.specflow/execution.lock`.
//!
//! Advisory and keyed by process id. A lock whose holder is no longer alive
//! is stale and removed on the next acquire. The file is written under a
//! temporary name and hard-linked into place, so a reader never sees a
//! half-written lock from a live holder; an unreadable lock is only cleared
//! once it is older than [`UNREADABLE_LOCK_GRACE`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::config::Config;
use crate::util::blocking;
use crate::{sflog, sflog_debug, sflog_warn, Error, Result};

pub const LOCK_FILE_NAME: &str = "execution.lock";

/// How long an unparseable lock is assumed to belong to a holder that is
/// still writing it.
pub const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub spec_set_id: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub fn lock_path(root: &Path) -> PathBuf {
    Config::state_dir(root).join(LOCK_FILE_NAME)
}

/// Whether `pid` names a running process.
pub fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let proc_dir = Path::new("/proc");
    if proc_dir.is_dir() {
        return proc_dir.join(pid.to_string()).exists();
    }
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(true)
}

fn read_info(path: &Path) -> Option<LockInfo> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Read the current lock holder, if any.
pub async fn read_lock(root: &Path) -> Result<Option<LockInfo>> {
    let path = lock_path(root);
    blocking(move || Ok(read_info(&path))).await
}

/// A held execution lock. Removed by `release`, or on drop as a fallback.
#[derive(Debug)]
pub struct ExecutionLock {
    path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl ExecutionLock {
    /// Take the lock for `spec_set_id`, clearing a stale one first.
    pub async fn acquire(root: &Path, spec_set_id: &str) -> Result<Self> {
        let path = lock_path(root);
        let info = LockInfo {
            pid: std::process::id(),
            spec_set_id: spec_set_id.to_string(),
            acquired_at: Utc::now(),
            extra: serde_json::Map::new(),
        };

        let lock_file = path.clone();
        let ours = info.clone();
        blocking(move || {
            if let Some(parent) = lock_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Second attempt only after removing a stale lock.
            for _ in 0..2 {
                if publish(&lock_file, &ours)? {
                    return Ok(());
                }
                match read_info(&lock_file) {
                    Some(holder) if process_alive(holder.pid) => {
                        return Err(Error::LockHeld {
                            pid: holder.pid,
                            path: lock_file.clone(),
                        });
                    }
                    Some(holder) => sflog_warn!(
                        "removing stale lock from dead process {} (spec set {})",
                        holder.pid,
                        holder.spec_set_id
                    ),
                    None => match lock_age(&lock_file) {
                        // Released between our attempt and the read.
                        None => continue,
                        Some(age) if age < UNREADABLE_LOCK_GRACE => {
                            return Err(Error::LockUnreadable {
                                path: lock_file.clone(),
                            });
                        }
                        Some(age) => sflog_warn!(
                            "removing unreadable lock {} ({}s old)",
                            lock_file.display(),
                            age.as_secs()
                        ),
                    },
                }
                match std::fs::remove_file(&lock_file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Err(Error::Validation(format!(
                "could not acquire {} after clearing a stale lock",
                lock_file.display()
            )))
        })
        .await?;

        sflog!("acquired execution lock for {} (pid {})", spec_set_id, info.pid);
        Ok(Self {
            path,
            info,
            released: false,
        })
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file if it is still ours.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let path = self.path.clone();
        let pid = self.info.pid;
        blocking(move || remove_if_owned(&path, pid)).await?;
        sflog_debug!("released execution lock {}", self.path.display());
        Ok(())
    }
}

/// Write `info` under a temporary name and hard-link it to `lock_file`.
/// Returns false when a lock already exists.
fn publish(lock_file: &Path, info: &LockInfo) -> Result<bool> {
    let staged = lock_file.with_extension(format!("lock.{}.tmp", info.pid));
    std::fs::write(&staged, serde_json::to_string_pretty(info)?)?;
    let linked = std::fs::hard_link(&staged, lock_file);
    if let Err(e) = std::fs::remove_file(&staged) {
        sflog_debug!("failed to remove staged lock {}: {}", staged.display(), e);
    }
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Time since the lock file was last written, or `None` if it is gone.
fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(modified.elapsed().unwrap_or_default())
}

fn remove_if_owned(path: &Path, pid: u32) -> Result<()> {
    match read_info(path) {
        Some(holder) if holder.pid == pid => match std::fs::remove_file(path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

impl Drop for ExecutionLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = remove_if_owned(&self.path, self.info.pid) {
                sflog_warn!("failed to remove execution lock on drop: {}", e);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnlockOutcome {
    NotLocked,
    Removed(LockInfo),
    /// Held by a live process and `force` was not given.
    HeldByLiveProcess(LockInfo),
}

/// Remove a stale lock, or any lock when `force` is set.
pub async fn unlock(root: &Path, force: bool) -> Result<UnlockOutcome> {
    let path = lock_path(root);
    blocking(move || {
        if !path.exists() {
            return Ok(UnlockOutcome::NotLocked);
        }
        let holder = read_info(&path);
        if let Some(info) = &holder {
            if !force && process_alive(info.pid) {
                return Ok(UnlockOutcome::HeldByLiveProcess(info.clone()));
            }
        }
        std::fs::remove_file(&path)?;
        Ok(UnlockOutcome::Removed(holder.unwrap_or_else(|| LockInfo {
            pid: 0,
            spec_set_id: String::new(),
            acquired_at: Utc::now(),
            extra: serde_json::Map::new(),
        })))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn write_lock(root: &Path, pid: u32) {
        let path = lock_path(root);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let info = LockInfo {
            pid,
            spec_set_id: "old".into(),
            acquired_at: Utc::now(),
            extra: serde_json::Map::new(),
        };
        std::fs::write(&path, serde_json::to_string(&info).unwrap()).unwrap();
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(dead_pid()));
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = ExecutionLock::acquire(dir.path(), "set").await.unwrap();
        assert_eq!(lock.info().pid, std::process::id());

        let on_disk = read_lock(dir.path()).await.unwrap().unwrap();
        assert_eq!(on_disk.spec_set_id, "set");

        lock.release().await.unwrap();
        assert!(read_lock(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_holder_fails_fast() {
        let dir = TempDir::new().unwrap();
        let _held = ExecutionLock::acquire(dir.path(), "first").await.unwrap();
        let err = ExecutionLock::acquire(dir.path(), "second").await.unwrap_err();
        assert!(matches!(err, Error::LockHeld { pid, .. } if pid == std::process::id()));
    }

    #[tokio::test]
    async fn test_stale_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        write_lock(dir.path(), dead_pid());

        let lock = ExecutionLock::acquire(dir.path(), "set").await.unwrap();
        assert_eq!(lock.info().spec_set_id, "set");
        let on_disk = read_lock(dir.path()).await.unwrap().unwrap();
        assert_eq!(on_disk.pid, std::process::id());
    }

    #[tokio::test]
    async fn test_fresh_unreadable_lock_is_not_taken() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // A competitor that has created the file but not written it yet.
        std::fs::write(&path, "").unwrap();

        let err = ExecutionLock::acquire(dir.path(), "second").await.unwrap_err();
        assert!(matches!(err, Error::LockUnreadable { .. }));
        assert!(path.exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn test_old_unreadable_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ truncated").unwrap();
        let old = std::time::SystemTime::now() - UNREADABLE_LOCK_GRACE * 3;
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let lock = ExecutionLock::acquire(dir.path(), "set").await.unwrap();
        assert_eq!(read_lock(dir.path()).await.unwrap().unwrap().pid, lock.info().pid);
    }

    #[tokio::test]
    async fn test_acquire_leaves_no_staged_file() {
        let dir = TempDir::new().unwrap();
        let _lock = ExecutionLock::acquire(dir.path(), "set").await.unwrap();
        let names: Vec<String> = std::fs::read_dir(Config::state_dir(dir.path()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![LOCK_FILE_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_drop_removes_lock() {
        let dir = TempDir::new().unwrap();
        {
            let _lock = ExecutionLock::acquire(dir.path(), "set").await.unwrap();
        }
        assert!(!lock_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_unlock() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            unlock(dir.path(), false).await.unwrap(),
            UnlockOutcome::NotLocked
        );

        write_lock(dir.path(), std::process::id());
        assert!(matches!(
            unlock(dir.path(), false).await.unwrap(),
            UnlockOutcome::HeldByLiveProcess(_)
        ));
        assert!(matches!(
            unlock(dir.path(), true).await.unwrap(),
            UnlockOutcome::Removed(info) if info.spec_set_id == "old"
        ));
        assert!(!lock_path(dir.path()).exists());
    }
}
