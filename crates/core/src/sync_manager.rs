//! Pull/merge/push state machine.
//!
//! A [`SyncManager`] owns the three replicas of one project (local tree,
//! ancestor snapshot, remote value) and drives sync cycles over them:
//!
//! `Idle -> (Pulling -> Merging)? -> (Pushing)? -> Idle`
//!
//! 1. If a pull is pending, pull the remote, merge it with the local tree
//!    against the ancestor, write the merge result locally and record the
//!    remote as the new ancestor.
//! 2. If pushing is enabled and the local tree differs from the ancestor,
//!    push it with the ancestor version as the compare-and-swap base.
//! 3. A rejected push marks a pull as pending and the cycle starts over.
//!
//! External triggers go through a [`Coalescer`], so at most one cycle runs
//! at a time and a burst of triggers costs at most one extra cycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::coalescer::{Action, BoxFuture, Coalescer, CoalescerStatus, Completion};
use crate::errors::SyncError;
use crate::merge::MergeEngine;
use crate::tree::{ChangeSet, FileTree};
use crate::value::{AncestorStore, RemoteClient, RemoteValue, TreeValue};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Step of the cycle currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Pulling,
    Merging,
    Pushing,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Pulling => write!(f, "pulling"),
            Self::Merging => write!(f, "merging"),
            Self::Pushing => write!(f, "pushing"),
        }
    }
}

/// Notifications published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Phase { phase: SyncPhase },
    Initialized { version: u64, files: usize },
    Pulled { version: u64 },
    Merged { actions: usize, conflicts: usize },
    Pushed { version: u64, changes: usize },
    PushRejected { old_version: u64 },
}

/// Tunables for one manager.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Push local changes during triggered cycles.
    pub push_enabled: bool,
    /// Wait before the first run of a coalesced burst.
    pub delay_before: Duration,
    /// Wait between a run and its queued rerun.
    pub delay_between: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            push_enabled: true,
            delay_before: Duration::ZERO,
            delay_between: Duration::from_millis(250),
        }
    }
}

/// Statistics from one `sync` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStats {
    pub cycle_id: Uuid,
    pub pulls: u32,
    pub pushes: u32,
    pub rejected_pushes: u32,
    /// Paths the merge engine acted on, summed over all pulls.
    pub merged_paths: usize,
    pub conflicts_resolved: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncStats {
    fn begin() -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            pulls: 0,
            pushes: 0,
            rejected_pushes: 0,
            merged_paths: 0,
            conflicts_resolved: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Replicas<L, C> {
    local: L,
    ancestor: AncestorStore,
    remote: RemoteValue<C>,
}

struct Inner<L, C> {
    replicas: tokio::sync::Mutex<Replicas<L, C>>,
    engine: MergeEngine,
    options: SyncOptions,
    need_pull: AtomicBool,
    /// Highest remote version seen; 0 when none is known.
    known_remote: AtomicU64,
    phase: Mutex<SyncPhase>,
    events: broadcast::Sender<SyncEvent>,
    coalescer: Coalescer,
}

/// Drives sync cycles for one project. Clones share the same state.
pub struct SyncManager<L, C> {
    inner: Arc<Inner<L, C>>,
}

impl<L, C> Clone for SyncManager<L, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L, C> SyncManager<L, C>
where
    L: TreeValue + 'static,
    C: RemoteClient + 'static,
{
    pub fn new(
        local: L,
        ancestor: AncestorStore,
        remote: RemoteValue<C>,
        engine: MergeEngine,
        options: SyncOptions,
    ) -> Self {
        let known = ancestor.current_version().unwrap_or(0);
        let (events, _) = broadcast::channel(64);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<L, C>>| {
            let weak = weak.clone();
            let action: Action = Arc::new(move || -> BoxFuture<anyhow::Result<()>> {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(inner) = weak.upgrade() else {
                        return Ok(());
                    };
                    inner.sync(None).await?;
                    Ok(())
                })
            });

            Inner {
                replicas: tokio::sync::Mutex::new(Replicas {
                    local,
                    ancestor,
                    remote,
                }),
                engine,
                need_pull: AtomicBool::new(true),
                known_remote: AtomicU64::new(known),
                phase: Mutex::new(SyncPhase::Idle),
                events,
                coalescer: Coalescer::new(action, options.delay_before, options.delay_between),
                options,
            }
        });

        Self { inner }
    }

    /// Establish the ancestor, or validate that one exists.
    ///
    /// Without an ancestor, `init_allowed` must be set: the local tree is
    /// replaced by the remote tree exactly and the remote is recorded as the
    /// ancestor, with no merge. With `sync_now`, a full sync cycle runs
    /// afterwards in either case and its statistics are returned.
    pub async fn init(&self, init_allowed: bool, sync_now: bool) -> Result<Option<SyncStats>, SyncError> {
        {
            let mut r = self.inner.replicas.lock().await;
            if !r.ancestor.exists() {
                if !init_allowed {
                    return Err(SyncError::NoAncestor);
                }
                self.inner.set_phase(SyncPhase::Pulling);
                let result = self.inner.seed(&mut r).await;
                self.inner.set_phase(SyncPhase::Idle);
                result?;
            }
        }

        if sync_now {
            self.inner.need_pull.store(true, Ordering::SeqCst);
            return self.sync(None).await.map(Some);
        }
        Ok(None)
    }

    /// Run cycles until nothing is pending. `push_enabled` overrides the
    /// configured default for this call.
    pub async fn sync(&self, push_enabled: Option<bool>) -> Result<SyncStats, SyncError> {
        self.inner.sync(push_enabled).await
    }

    /// Schedule a pull if `version` is newer than any version seen so far.
    pub fn notify_remote_change(&self, version: u64) -> bool {
        let known = self.inner.known_remote.load(Ordering::SeqCst);
        if version <= known {
            debug!(version, known, "remote notification not newer, ignoring");
            return false;
        }
        info!(version, known, "remote changed");
        self.inner.need_pull.store(true, Ordering::SeqCst);
        self.inner.coalescer.request();
        true
    }

    /// Schedule a cycle for a local edit. Does not force a pull.
    pub fn notify_local_change(&self) -> Completion {
        debug!("local change notified");
        self.inner.coalescer.request()
    }

    /// Request a cycle and wait for the run that serves it.
    pub async fn trigger(&self) -> CoalescerStatus {
        self.inner.coalescer.trigger().await
    }

    pub fn status(&self) -> CoalescerStatus {
        self.inner.coalescer.status()
    }

    /// Wait for the cycle in flight, if any, without scheduling another.
    pub async fn wait_idle(&self) -> CoalescerStatus {
        match self.inner.coalescer.in_flight() {
            Some(running) => running.wait().await,
            None => self.status(),
        }
    }

    /// Cycles run through the coalescer so far.
    pub fn cycles(&self) -> u64 {
        self.inner.coalescer.runs()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.coalescer.last_error()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CoalescerStatus> {
        self.inner.coalescer.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn need_pull(&self) -> bool {
        self.inner.need_pull.load(Ordering::SeqCst)
    }

    /// Highest remote version seen, if any.
    pub fn known_remote_version(&self) -> Option<u64> {
        match self.inner.known_remote.load(Ordering::SeqCst) {
            0 => None,
            v => Some(v),
        }
    }

    /// Current ancestor tree and version.
    pub async fn ancestor(&self) -> (FileTree, Option<u64>) {
        let r = self.inner.replicas.lock().await;
        (r.ancestor.tree().clone(), r.ancestor.current_version())
    }

    pub async fn local_value(&self) -> Result<FileTree, SyncError> {
        let r = self.inner.replicas.lock().await;
        Ok(r.local.value().await?)
    }

    /// Run `f` against the local replica between cycles.
    pub async fn with_local<R>(&self, f: impl FnOnce(&mut L) -> R) -> R {
        let mut r = self.inner.replicas.lock().await;
        f(&mut r.local)
    }

    pub async fn with_remote<R>(&self, f: impl FnOnce(&RemoteValue<C>) -> R) -> R {
        let r = self.inner.replicas.lock().await;
        f(&r.remote)
    }
}

impl<L, C> Inner<L, C>
where
    L: TreeValue + 'static,
    C: RemoteClient + 'static,
{
    fn set_phase(&self, phase: SyncPhase) {
        let mut current = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *current != phase {
            debug!(from = %*current, to = %phase, "phase transition");
            *current = phase;
            self.emit(SyncEvent::Phase { phase });
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn observe_remote(&self, version: u64) {
        self.known_remote.fetch_max(version, Ordering::SeqCst);
    }

    async fn seed(&self, r: &mut Replicas<L, C>) -> Result<(), SyncError> {
        let snapshot = r.remote.pull().await?;
        let local = r.local.value().await?;
        let dropped = local.keys().filter(|k| !snapshot.value.contains_key(*k)).count();

        self.commit(r, &snapshot.value, snapshot.version, Some(&snapshot.value))
            .await?;
        self.observe_remote(snapshot.version);
        self.need_pull.store(false, Ordering::SeqCst);

        info!(
            version = snapshot.version,
            files = snapshot.value.len(),
            dropped_local = dropped,
            "initialised from remote"
        );
        self.emit(SyncEvent::Initialized {
            version: snapshot.version,
            files: snapshot.value.len(),
        });
        Ok(())
    }

    /// Record `ancestor` at `version`, then write `local` if given.
    ///
    /// If the local write fails the previous ancestor is put back, so a
    /// failed commit leaves both replicas as they were.
    async fn commit(
        &self,
        r: &mut Replicas<L, C>,
        ancestor: &FileTree,
        version: u64,
        local: Option<&FileTree>,
    ) -> Result<(), SyncError> {
        let previous = r
            .ancestor
            .current_version()
            .map(|v| (r.ancestor.tree().clone(), v));
        let unchanged = previous
            .as_ref()
            .is_some_and(|(tree, v)| *v == version && tree == ancestor);
        if !unchanged {
            r.ancestor.record(ancestor, version)?;
        }

        let Some(local) = local else {
            return Ok(());
        };
        if let Err(e) = r.local.set_value(local).await {
            if !unchanged {
                let restored = match &previous {
                    Some((tree, v)) => r.ancestor.record(tree, *v),
                    None => r.ancestor.clear(),
                };
                if let Err(restore_err) = restored {
                    error!(error = %restore_err, "failed to restore ancestor after local write error");
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn sync(&self, push_enabled: Option<bool>) -> Result<SyncStats, SyncError> {
        let push = push_enabled.unwrap_or(self.options.push_enabled);
        let mut replicas = self.replicas.lock().await;
        let mut stats = SyncStats::begin();
        debug!(cycle = %stats.cycle_id, push, "sync started");

        let result = self.run(&mut replicas, push, &mut stats).await;
        self.set_phase(SyncPhase::Idle);
        stats.completed_at = Some(Utc::now());

        match result {
            Ok(()) => {
                info!(
                    cycle = %stats.cycle_id,
                    pulls = stats.pulls,
                    pushes = stats.pushes,
                    rejected = stats.rejected_pushes,
                    merged = stats.merged_paths,
                    "sync complete"
                );
                Ok(stats)
            }
            Err(e) => {
                error!(cycle = %stats.cycle_id, error = %e, "sync failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        r: &mut Replicas<L, C>,
        push: bool,
        stats: &mut SyncStats,
    ) -> Result<(), SyncError> {
        if !r.ancestor.exists() {
            return Err(SyncError::NoAncestor);
        }

        loop {
            // Cleared before pulling so a notification that arrives during
            // the pull is not lost.
            if self.need_pull.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.pull_and_merge(r, stats).await {
                    self.need_pull.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }

            if !push {
                if self.need_pull.load(Ordering::SeqCst) {
                    continue;
                }
                return Ok(());
            }

            let local = r.local.value().await?;
            if local == *r.ancestor.tree() {
                debug!("local matches ancestor, nothing to push");
                return Ok(());
            }

            let base = r.ancestor.current_version().ok_or(SyncError::NoAncestor)?;
            let changes = ChangeSet::between(r.ancestor.tree(), &local);
            self.set_phase(SyncPhase::Pushing);
            info!(
                base,
                new = changes.new.len(),
                deleted = changes.delete.len(),
                changed = changes.changed.len(),
                "pushing local changes"
            );

            if r.remote.push_from(base, &local).await? {
                let version = base + 1;
                r.ancestor.record(&local, version)?;
                self.observe_remote(version);
                stats.pushes += 1;
                self.emit(SyncEvent::Pushed {
                    version,
                    changes: changes.total(),
                });
            } else {
                warn!(base, "push rejected, pulling again");
                stats.rejected_pushes += 1;
                self.need_pull.store(true, Ordering::SeqCst);
                self.emit(SyncEvent::PushRejected { old_version: base });
            }
        }
    }

    async fn pull_and_merge(&self, r: &mut Replicas<L, C>, stats: &mut SyncStats) -> Result<(), SyncError> {
        self.set_phase(SyncPhase::Pulling);
        let snapshot = r.remote.pull().await?;
        stats.pulls += 1;
        self.observe_remote(snapshot.version);
        self.emit(SyncEvent::Pulled {
            version: snapshot.version,
        });

        self.set_phase(SyncPhase::Merging);
        let local = r.local.value().await?;
        let merged = self.engine.merge(&local, r.ancestor.tree(), &snapshot.value)?;

        // Nothing is written until the whole merge has succeeded.
        let write_local = (merged.local != local).then_some(&merged.local);
        self.commit(r, &snapshot.value, snapshot.version, write_local)
            .await?;

        stats.merged_paths += merged.actions.len();
        stats.conflicts_resolved += merged.conflicts();
        self.emit(SyncEvent::Merged {
            actions: merged.actions.len(),
            conflicts: merged.conflicts(),
        });
        Ok(())
    }
}
