//! Background sweep that expires stale sessions.
//!
//! Runs periodically, marking sessions whose expiry time has passed. Records
//! marked in one sweep are purged in the next, so late subscribers can still
//! inspect them briefly.

use crate::store::{SessionEvent, SessionStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Session store shared between the lifecycle sweep and the orchestrator.
pub type SharedStore = Arc<tokio::sync::Mutex<SessionStore>>;

/// Periodic session expiry.
pub struct SessionLifecycle {
    store: SharedStore,
    interval: Duration,
    events: broadcast::Sender<SessionEvent>,
    expired_total: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycle")
            .field("interval", &self.interval)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl SessionLifecycle {
    /// Create a stopped lifecycle manager.
    ///
    /// `events` must be the sender the store publishes on.
    pub fn new(
        store: SharedStore,
        interval: Duration,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            store,
            interval,
            events,
            expired_total: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Start the periodic sweep. No-op if already running.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let store = self.store.clone();
        let expired_total = self.expired_total.clone();
        let period = self.interval;
        tracing::info!("Session sweep started (interval: {}s)", period.as_secs());

        *task = Some(tokio::spawn(async move {
            let mut timer = interval(period);
            // First tick completes immediately.
            timer.tick().await;

            loop {
                timer.tick().await;
                let expired = sweep(&store, &expired_total).await;
                if expired > 0 {
                    tracing::info!("Sweep: expired {} sessions", expired);
                } else {
                    tracing::debug!("Sweep: no expired sessions");
                }
            }
        }));
    }

    /// Stop the periodic sweep.
    pub fn stop(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::info!("Session sweep stopped");
        }
    }

    /// Whether the periodic sweep is running.
    pub fn is_active(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run one sweep now. Returns the number of sessions expired.
    pub async fn cleanup_expired_sessions(&self) -> usize {
        sweep(&self.store, &self.expired_total).await
    }

    /// Sessions expired since startup.
    pub fn expired_total(&self) -> u64 {
        self.expired_total.load(Ordering::Relaxed)
    }

    /// Subscribe to expiry and deletion events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl Drop for SessionLifecycle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweep(store: &SharedStore, expired_total: &AtomicU64) -> usize {
    let mut store = store.lock().await;

    let purged = store.purge_expired();
    if purged > 0 {
        tracing::debug!("Sweep: purged {} expired records", purged);
    }

    let expired = store
        .get_expired_sessions()
        .into_iter()
        .filter(|id| store.mark_expired(id))
        .count();
    expired_total.fetch_add(expired as u64, Ordering::Relaxed);
    expired
}
