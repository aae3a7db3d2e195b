//! The remote copy, reachable only through a pull/push client.
//!
//! Writes are optimistic compare-and-swap on the version number: a push
//! names the version it was based on and the remote accepts it only if that
//! is still the current version. A rejection is `Ok(false)`, not an error.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{CoreError, RemoteError};
use crate::tree::FileTree;
use crate::value::TreeValue;

// ---------------------------------------------------------------------------
// Client contract
// ---------------------------------------------------------------------------

/// A remote tree at a specific version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub value: FileTree,
    pub version: u64,
}

/// A version-gated write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub old_version: u64,
    pub new_version: u64,
    pub value: FileTree,
}

/// Network (or storage) collaborator holding the authoritative tree.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn pull(&self) -> Result<RemoteSnapshot, RemoteError>;

    /// Apply `request` if `request.old_version` is the current version.
    /// Returns `Ok(false)` on a version mismatch.
    async fn push(&self, request: PushRequest) -> Result<bool, RemoteError>;
}

// ---------------------------------------------------------------------------
// RemoteValue
// ---------------------------------------------------------------------------

/// Cached view of the remote tree.
pub struct RemoteValue<C> {
    client: C,
    cached: Option<RemoteSnapshot>,
}

impl<C: RemoteClient> RemoteValue<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            cached: None,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn snapshot(&self) -> Option<&RemoteSnapshot> {
        self.cached.as_ref()
    }

    /// Version of the last pulled or pushed snapshot.
    pub fn known_version(&self) -> Option<u64> {
        self.cached.as_ref().map(|s| s.version)
    }

    /// Fetch the current remote snapshot and cache it.
    pub async fn pull(&mut self) -> Result<RemoteSnapshot, RemoteError> {
        let snapshot = self.client.pull().await?;
        if snapshot.version == 0 {
            return Err(RemoteError::MissingVersion);
        }
        debug!(version = snapshot.version, files = snapshot.value.len(), "pulled remote");
        self.cached = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Push `value` as the successor of the cached version.
    pub async fn push(&mut self, value: &FileTree) -> Result<bool, RemoteError> {
        let old_version = self.known_version().ok_or(RemoteError::NotPulled)?;
        self.push_from(old_version, value).await
    }

    /// Push `value` as the successor of `old_version`, the version the
    /// caller's changes are based on.
    pub async fn push_from(&mut self, old_version: u64, value: &FileTree) -> Result<bool, RemoteError> {
        let request = PushRequest {
            old_version,
            new_version: old_version + 1,
            value: value.clone(),
        };
        let new_version = request.new_version;

        if self.client.push(request).await? {
            info!(old_version, new_version, "push accepted");
            self.cached = Some(RemoteSnapshot {
                value: value.clone(),
                version: new_version,
            });
            Ok(true)
        } else {
            warn!(old_version, "push rejected, remote moved on");
            Ok(false)
        }
    }
}

#[async_trait]
impl<C: RemoteClient> TreeValue for RemoteValue<C> {
    async fn value(&self) -> Result<FileTree, CoreError> {
        self.cached
            .as_ref()
            .map(|s| s.value.clone())
            .ok_or_else(|| RemoteError::NotPulled.into())
    }

    async fn version(&self) -> Result<Option<u64>, CoreError> {
        Ok(self.known_version())
    }

    async fn set_value(&mut self, value: &FileTree) -> Result<bool, CoreError> {
        Ok(self.push(value).await?)
    }
}

// ---------------------------------------------------------------------------
// MemoryRemote
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryRemoteState {
    snapshot: RemoteSnapshot,
    reject_next: usize,
    offline: bool,
    pulls: usize,
    accepted: usize,
    rejected: usize,
}

/// In-process remote with real compare-and-swap semantics.
///
/// Clones share state, so a test can keep a handle while the sync manager
/// owns another and play the part of a concurrent writer.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<MemoryRemoteState>>,
}

impl MemoryRemote {
    pub fn new(value: FileTree, version: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryRemoteState {
                snapshot: RemoteSnapshot { value, version },
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryRemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> RemoteSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn version(&self) -> u64 {
        self.lock().snapshot.version
    }

    /// Write a new tree as another client would, bumping the version.
    pub fn write(&self, value: FileTree) -> u64 {
        let mut state = self.lock();
        state.snapshot.version += 1;
        state.snapshot.value = value;
        state.snapshot.version
    }

    /// Refuse the next `n` pushes regardless of version.
    pub fn reject_next(&self, n: usize) {
        self.lock().reject_next = n;
    }

    /// Fail every pull and push with a transport error while set.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn pulls(&self) -> usize {
        self.lock().pulls
    }

    pub fn accepted_pushes(&self) -> usize {
        self.lock().accepted
    }

    pub fn rejected_pushes(&self) -> usize {
        self.lock().rejected
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn pull(&self) -> Result<RemoteSnapshot, RemoteError> {
        let mut state = self.lock();
        if state.offline {
            return Err(anyhow::anyhow!("remote offline").into());
        }
        state.pulls += 1;
        Ok(state.snapshot.clone())
    }

    async fn push(&self, request: PushRequest) -> Result<bool, RemoteError> {
        let mut state = self.lock();
        if state.offline {
            return Err(anyhow::anyhow!("remote offline").into());
        }
        if state.reject_next > 0 {
            state.reject_next -= 1;
            state.rejected += 1;
            return Ok(false);
        }
        if request.old_version != state.snapshot.version {
            state.rejected += 1;
            return Ok(false);
        }
        state.snapshot = RemoteSnapshot {
            value: request.value,
            version: request.new_version,
        };
        state.accepted += 1;
        Ok(true)
    }
}
