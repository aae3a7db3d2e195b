//! Directory-backed remote: a shared JSON snapshot guarded by a lock file.
//!
//! Several working copies on one machine (or on a shared mount) can sync
//! against the same directory. Each push takes `remote.lock` with
//! `create_new`, checks the version, writes `snapshot.json` atomically and
//! releases the lock.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::{io_err, RemoteError, ValueError};
use crate::tree::FileTree;
use crate::value::ancestor::{read_json, write_atomic};
use crate::value::remote::{PushRequest, RemoteClient, RemoteSnapshot};

const SNAPSHOT_FILE: &str = "snapshot.json";
const LOCK_FILE: &str = "remote.lock";
const LOCK_ATTEMPTS: u32 = 50;
const LOCK_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct DirRemote {
    dir: PathBuf,
}

/// Removes the lock file when dropped.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl DirRemote {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create a remote holding `value` at version 1. Fails if one exists.
    pub fn create(dir: impl Into<PathBuf>, value: &FileTree) -> Result<Self, RemoteError> {
        let remote = Self::new(dir);
        std::fs::create_dir_all(&remote.dir).map_err(|e| io_err(&remote.dir, e))?;
        let path = remote.snapshot_path();
        if path.exists() {
            return Err(anyhow!("remote already exists at {}", path.display()).into());
        }
        let snapshot = RemoteSnapshot {
            value: value.clone(),
            version: 1,
        };
        write_atomic(&path, &serde_json::to_vec(&snapshot).map_err(ValueError::from)?)?;
        info!(dir = %remote.dir.display(), files = value.len(), "created directory remote");
        Ok(remote)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path().exists()
    }

    fn read(&self) -> Result<RemoteSnapshot, RemoteError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Err(anyhow!("no remote snapshot at {}", path.display()).into());
        }
        Ok(read_json(&path)?)
    }

    /// Current remote version, or `None` when no snapshot exists yet.
    pub fn peek_version(&self) -> Result<Option<u64>, RemoteError> {
        if !self.exists() {
            return Ok(None);
        }
        Ok(Some(self.read()?.version))
    }

    async fn acquire_lock(&self) -> Result<LockGuard, RemoteError> {
        let path = self.dir.join(LOCK_FILE);
        for attempt in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(LockGuard { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(attempt, "remote locked, waiting");
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(io_err(&path, e).into()),
            }
        }
        Err(anyhow!("timed out waiting for {}", path.display()).into())
    }
}

#[async_trait]
impl RemoteClient for DirRemote {
    async fn pull(&self) -> Result<RemoteSnapshot, RemoteError> {
        self.read()
    }

    async fn push(&self, request: PushRequest) -> Result<bool, RemoteError> {
        let _lock = self.acquire_lock().await?;

        let current = self.read()?;
        if current.version != request.old_version {
            debug!(
                expected = request.old_version,
                actual = current.version,
                "version mismatch"
            );
            return Ok(false);
        }

        let snapshot = RemoteSnapshot {
            value: request.value,
            version: request.new_version,
        };
        write_atomic(
            &self.snapshot_path(),
            &serde_json::to_vec(&snapshot).map_err(ValueError::from)?,
        )?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::FileContent;
    use tempfile::TempDir;

    fn tree(entries: &[(&str, &str)]) -> FileTree {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), FileContent::from(*v)))
            .collect()
    }

    #[tokio::test]
    async fn test_create_pull_push() {
        let dir = TempDir::new().unwrap();
        let remote = DirRemote::create(dir.path().join("remote"), &tree(&[("a", "1")])).unwrap();

        let snap = remote.pull().await.unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(remote.peek_version().unwrap(), Some(1));

        let ok = remote
            .push(PushRequest {
                old_version: 1,
                new_version: 2,
                value: tree(&[("a", "2")]),
            })
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(remote.pull().await.unwrap().value, tree(&[("a", "2")]));
        assert!(!dir.path().join("remote").join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_stale_push_rejected() {
        let dir = TempDir::new().unwrap();
        let remote = DirRemote::create(dir.path(), &FileTree::new()).unwrap();
        let ok = remote
            .push(PushRequest {
                old_version: 7,
                new_version: 8,
                value: tree(&[("x", "y")]),
            })
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(remote.peek_version().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_missing_remote() {
        let dir = TempDir::new().unwrap();
        let remote = DirRemote::new(dir.path());
        assert_eq!(remote.peek_version().unwrap(), None);
        assert!(matches!(remote.pull().await, Err(RemoteError::Transport(_))));
        assert!(DirRemote::create(dir.path(), &FileTree::new()).is_ok());
        assert!(DirRemote::create(dir.path(), &FileTree::new()).is_err());
    }

    #[tokio::test]
    async fn test_held_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let remote = DirRemote::create(dir.path(), &FileTree::new()).unwrap();
        std::fs::write(dir.path().join(LOCK_FILE), "").unwrap();
        let res = remote
            .push(PushRequest {
                old_version: 1,
                new_version: 2,
                value: FileTree::new(),
            })
            .await;
        assert!(matches!(res, Err(RemoteError::Transport(_))));
    }
}
