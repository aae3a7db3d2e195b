//! Change detection loop feeding the sync manager.
//!
//! On every tick the scheduler hashes the local working tree and reads the
//! remote version marker. A changed hash becomes a local-change notification
//! and a newer version a remote-change notification. The manager's coalescer
//! decides when cycles actually run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time;
use tracing::{debug, error, info, warn};

use treesync_core::hash::ContentHash;
use treesync_core::sync_manager::{SyncEvent, SyncManager};
use treesync_core::value::{DirRemote, LocalFileTree};
use treesync_core::CoalescerStatus;

/// Aggregate counters across the daemon's lifetime.
pub struct SchedulerStats {
    pub polls: AtomicU64,
    pub local_changes: AtomicU64,
    pub remote_changes: AtomicU64,
    pub poll_errors: AtomicU64,
}

impl SchedulerStats {
    fn new() -> Self {
        Self {
            polls: AtomicU64::new(0),
            local_changes: AtomicU64::new(0),
            remote_changes: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
        }
    }
}

pub struct Scheduler {
    manager: SyncManager<LocalFileTree, DirRemote>,
    /// Scanned outside the manager's lock, for change detection only.
    local: LocalFileTree,
    remote: DirRemote,
    poll_interval: Duration,
    last_local: Option<ContentHash>,
    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new(
        manager: SyncManager<LocalFileTree, DirRemote>,
        local: LocalFileTree,
        remote: DirRemote,
        poll_interval: Duration,
    ) -> Self {
        Self {
            manager,
            local,
            remote,
            poll_interval,
            last_local: None,
            stats: SchedulerStats::new(),
        }
    }

    /// Poll until `shutdown` is notified, then wait for the in-flight cycle.
    pub async fn run(&mut self, shutdown: Arc<Notify>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            root = %self.local.root().display(),
            remote = %self.remote.dir().display(),
            "scheduler started"
        );

        let events = tokio::spawn(log_events(self.manager.subscribe()));

        // Baseline so the first tick only reacts to edits made after startup.
        self.last_local = self.hash_local().await;

        let mut interval = time::interval(self.poll_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll().await;
                }
                _ = shutdown.notified() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }

        let status = self.manager.wait_idle().await;
        info!(
            status = %status,
            polls = self.stats.polls.load(Ordering::SeqCst),
            local_changes = self.stats.local_changes.load(Ordering::SeqCst),
            remote_changes = self.stats.remote_changes.load(Ordering::SeqCst),
            poll_errors = self.stats.poll_errors.load(Ordering::SeqCst),
            cycles = self.manager.cycles(),
            "scheduler stopped"
        );
        events.abort();
    }

    async fn poll(&mut self) {
        self.stats.polls.fetch_add(1, Ordering::SeqCst);

        match self.remote.peek_version() {
            Ok(Some(version)) => {
                if self.manager.notify_remote_change(version) {
                    self.stats.remote_changes.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(None) => debug!("remote has no snapshot yet"),
            Err(e) => {
                self.stats.poll_errors.fetch_add(1, Ordering::SeqCst);
                warn!(error = %e, "failed to read remote version");
            }
        }

        let current = self.hash_local().await;
        if current.is_some() && current != self.last_local {
            debug!(hash = ?current, "local tree changed");
            self.stats.local_changes.fetch_add(1, Ordering::SeqCst);
            self.last_local = current;
            let _ = self.manager.notify_local_change();
        }

        if self.manager.status() == CoalescerStatus::Error {
            if let Some(err) = self.manager.last_error() {
                error!(error = %err, "last sync cycle failed");
            }
        }
    }

    /// Hash of the working tree, or `None` if it could not be read.
    async fn hash_local(&self) -> Option<ContentHash> {
        let local = self.local.clone();
        match tokio::task::spawn_blocking(move || local.scan()).await {
            Ok(Ok(tree)) => Some(ContentHash::of_tree(&tree)),
            Ok(Err(e)) => {
                self.stats.poll_errors.fetch_add(1, Ordering::SeqCst);
                warn!(error = %e, "failed to scan local tree");
                None
            }
            Err(e) => {
                error!(error = %e, "local scan task failed");
                None
            }
        }
    }
}

async fn log_events(mut rx: broadcast::Receiver<SyncEvent>) {
    loop {
        match rx.recv().await {
            Ok(SyncEvent::Phase { .. }) => {}
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!(event = %json, "sync event"),
                Err(e) => warn!(error = %e, "failed to encode sync event"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "sync event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
