//! Trigger coalescing for sync cycles.
//!
//! A [`Coalescer`] runs one async action at a time. Triggers that arrive
//! while a run is in flight do not start a second run: they mark the
//! current one for a single rerun and wait on the same completion. When the
//! run finishes and a rerun was requested, the coalescer waits
//! `delay_between` and runs again, until a run completes with no new
//! trigger behind it.
//!
//! Status moves `Clean -> Working -> Clean | Error` and is published on a
//! `tokio::sync::watch` channel. A failed run sets `Error` but never blocks
//! later triggers.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The action a coalescer runs. Called once per run.
pub type Action = Arc<dyn Fn() -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

/// Externally visible state of a coalescer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoalescerStatus {
    Clean,
    Working,
    Error,
}

impl std::fmt::Display for CoalescerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::Working => write!(f, "working"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Default)]
struct State {
    in_flight: Option<watch::Receiver<Option<CoalescerStatus>>>,
    again: bool,
    last_error: Option<String>,
    runs: u64,
}

struct Inner {
    action: Action,
    delay_before: Duration,
    delay_between: Duration,
    state: Mutex<State>,
    status: watch::Sender<CoalescerStatus>,
}

/// Serialises repeated requests into one in-flight run plus one rerun.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<Inner>,
}

/// Resolves when the run sequence serving a request finishes.
pub struct Completion {
    rx: watch::Receiver<Option<CoalescerStatus>>,
}

impl Completion {
    /// Final status of the run sequence.
    pub async fn wait(mut self) -> CoalescerStatus {
        loop {
            if let Some(status) = *self.rx.borrow_and_update() {
                return status;
            }
            if self.rx.changed().await.is_err() {
                // Runner dropped without reporting: it panicked.
                return CoalescerStatus::Error;
            }
        }
    }
}

/// Clears `in_flight` if the run loop unwinds before finishing normally.
struct InFlightGuard {
    inner: Arc<Inner>,
    armed: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.lock();
            state.in_flight = None;
            state.last_error = Some("sync action panicked".to_string());
            self.inner.status.send_replace(CoalescerStatus::Error);
        }
    }
}

impl Coalescer {
    pub fn new(action: Action, delay_before: Duration, delay_between: Duration) -> Self {
        let (status, _) = watch::channel(CoalescerStatus::Clean);
        Self {
            inner: Arc::new(Inner {
                action,
                delay_before,
                delay_between,
                state: Mutex::new(State::default()),
                status,
            }),
        }
    }

    /// Build from a plain async closure.
    pub fn from_fn<F, Fut>(f: F, delay_before: Duration, delay_between: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let action: Action = Arc::new(move || -> BoxFuture<anyhow::Result<()>> { Box::pin(f()) });
        Self::new(action, delay_before, delay_between)
    }

    /// Request a run and wait for the run sequence that serves it.
    pub async fn trigger(&self) -> CoalescerStatus {
        self.request().wait().await
    }

    /// Request a run without waiting. Starts a run if none is in flight,
    /// otherwise marks the current one for a rerun.
    pub fn request(&self) -> Completion {
        let mut state = self.inner.lock();
        if let Some(rx) = state.in_flight.clone() {
            debug!("run in flight, queueing rerun");
            state.again = true;
            return Completion { rx };
        }

        let (tx, rx) = watch::channel(None);
        state.in_flight = Some(rx.clone());
        // Working covers the delay_before window too.
        self.inner.status.send_replace(CoalescerStatus::Working);
        drop(state);

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run_loop(tx).await });
        Completion { rx }
    }

    pub fn status(&self) -> CoalescerStatus {
        *self.inner.status.borrow()
    }

    /// Observe status changes.
    pub fn subscribe(&self) -> watch::Receiver<CoalescerStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().in_flight.is_some()
    }

    /// Completion of the run sequence in flight, without requesting a rerun.
    pub fn in_flight(&self) -> Option<Completion> {
        self.inner
            .lock()
            .in_flight
            .clone()
            .map(|rx| Completion { rx })
    }

    /// Message of the most recent failed run, cleared by a successful one.
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Total number of completed runs.
    pub fn runs(&self) -> u64 {
        self.inner.lock().runs
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_loop(self: Arc<Self>, done: watch::Sender<Option<CoalescerStatus>>) {
        let mut guard = InFlightGuard {
            inner: self.clone(),
            armed: true,
        };

        if !self.delay_before.is_zero() {
            tokio::time::sleep(self.delay_before).await;
        }

        let mut final_status;
        loop {
            self.lock().again = false;

            let result = (self.action)().await;

            let again = {
                let mut state = self.lock();
                state.runs += 1;
                match result {
                    Ok(()) => {
                        state.last_error = None;
                        final_status = CoalescerStatus::Clean;
                    }
                    Err(e) => {
                        let msg = format!("{e:#}");
                        error!(error = %msg, "coalesced run failed");
                        state.last_error = Some(msg);
                        final_status = CoalescerStatus::Error;
                    }
                }
                if state.again {
                    true
                } else {
                    // Publish before a new request can start the next loop.
                    self.status.send_replace(final_status);
                    state.in_flight = None;
                    false
                }
            };

            if !again {
                break;
            }
            debug!(delay_ms = self.delay_between.as_millis() as u64, "rerun requested");
            tokio::time::sleep(self.delay_between).await;
        }

        guard.armed = false;
        info!(status = %final_status, "coalesced runs finished");
        let _ = done.send(Some(final_status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(runs: Arc<AtomicUsize>, work: Duration) -> Action {
        Arc::new(move || -> BoxFuture<anyhow::Result<()>> {
            let runs = runs.clone();
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(work).await;
                Ok(())
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trigger_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let c = Coalescer::new(counting(runs.clone(), Duration::from_millis(5)), Duration::ZERO, Duration::ZERO);
        assert_eq!(c.trigger().await, CoalescerStatus::Clean);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!c.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_rerun() {
        let runs = Arc::new(AtomicUsize::new(0));
        let c = Coalescer::new(
            counting(runs.clone(), Duration::from_millis(100)),
            Duration::ZERO,
            Duration::from_millis(10),
        );

        let first = c.request();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(c.status(), CoalescerStatus::Working);

        let burst: Vec<Completion> = (0..10).map(|_| c.request()).collect();
        for done in burst {
            assert_eq!(done.wait().await, CoalescerStatus::Clean);
        }
        assert_eq!(first.wait().await, CoalescerStatus::Clean);

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(c.runs(), 2);
        assert_eq!(c.status(), CoalescerStatus::Clean);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_triggers_each_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let c = Coalescer::new(counting(runs.clone(), Duration::from_millis(1)), Duration::ZERO, Duration::ZERO);
        for _ in 0..3 {
            c.trigger().await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_before_absorbs_early_triggers() {
        let runs = Arc::new(AtomicUsize::new(0));
        let c = Coalescer::new(
            counting(runs.clone(), Duration::from_millis(1)),
            Duration::from_millis(50),
            Duration::ZERO,
        );
        let a = c.request();
        let b = c.request();
        assert_eq!(c.status(), CoalescerStatus::Working);
        a.wait().await;
        b.wait().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(c.status(), CoalescerStatus::Clean);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_waits_without_rerun() {
        let runs = Arc::new(AtomicUsize::new(0));
        let c = Coalescer::new(
            counting(runs.clone(), Duration::from_millis(100)),
            Duration::ZERO,
            Duration::from_millis(10),
        );
        assert!(c.in_flight().is_none());

        let first = c.request();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let running = c.in_flight().expect("run in flight");
        assert_eq!(running.wait().await, CoalescerStatus::Clean);
        assert_eq!(first.wait().await, CoalescerStatus::Clean);

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(c.in_flight().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_does_not_block_later_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = {
            let calls = calls.clone();
            Coalescer::from_fn(
                move || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            anyhow::bail!("disk full");
                        }
                        Ok(())
                    }
                },
                Duration::ZERO,
                Duration::ZERO,
            )
        };
        let mut observer = c.subscribe();

        assert_eq!(c.trigger().await, CoalescerStatus::Error);
        assert_eq!(c.status(), CoalescerStatus::Error);
        assert_eq!(c.last_error().as_deref(), Some("disk full"));
        assert!(observer.has_changed().unwrap());
        assert_eq!(*observer.borrow_and_update(), CoalescerStatus::Error);

        assert_eq!(c.trigger().await, CoalescerStatus::Clean);
        assert_eq!(c.last_error(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
