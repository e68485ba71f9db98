//! Background maintenance: heartbeat reaper, cache evicter, store sweep.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::entity::{SessionState, stop_reason};
use crate::session::manager::SessionManager;
use crate::store::StateStore;

/// Enforces heartbeat deadlines and the session TTL.
pub struct SessionReaper {
    manager: SessionManager,
    interval: Duration,
}

impl SessionReaper {
    pub fn new(manager: SessionManager, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// One reaper pass. Returns how many sessions were stopped.
    pub async fn sweep_once(&self) -> usize {
        let sessions = match self.manager.list().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "reaper failed to scan sessions");
                return 0;
            }
        };
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.manager.session_ttl())
            .unwrap_or(chrono::Duration::MAX);
        let mut stopped = 0usize;

        for session in sessions {
            if session.is_terminal() {
                continue;
            }
            if session.state == SessionState::Ready && session.heartbeat_deadline < now {
                info!(session_id = %session.id, "heartbeat lost; stopping session");
                if self
                    .manager
                    .stop(&session.id, stop_reason::HEARTBEAT_LOST)
                    .await
                    .is_ok()
                {
                    stopped += 1;
                }
                continue;
            }
            if session.created_at + ttl < now {
                info!(session_id = %session.id, "session TTL exhausted; stopping");
                if self
                    .manager
                    .stop(&session.id, stop_reason::TTL_EXHAUSTED)
                    .await
                    .is_ok()
                {
                    stopped += 1;
                }
            }
        }
        stopped
    }

    pub async fn run(self, cancel: CancellationToken) {
        debug!(interval_secs = self.interval.as_secs(), "session reaper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep_once().await;
                }
            }
        }
        debug!("session reaper stopped");
    }
}

/// Deletes HLS directories of terminal sessions after the grace window.
pub struct CacheEvicter {
    store: Arc<dyn StateStore>,
    hls_root: PathBuf,
    grace: Duration,
    interval: Duration,
}

impl CacheEvicter {
    pub fn new(store: Arc<dyn StateStore>, hls_root: PathBuf, grace: Duration) -> Self {
        Self {
            store,
            hls_root,
            grace,
            interval: Duration::from_secs(30),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One eviction pass. Returns how many directories were removed.
    pub async fn sweep_once(&self) -> usize {
        let sessions = match self.store.scan_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "evicter failed to scan sessions");
                return 0;
            }
        };
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());
        let mut evicted = 0usize;

        for session in sessions {
            if !session.is_terminal() || session.transitioned_at + grace > now {
                continue;
            }
            let dir = self.hls_root.join(&session.id);
            if dir.is_dir() {
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {
                        debug!(session_id = %session.id, "evicted session artifacts");
                        evicted += 1;
                    }
                    Err(e) => {
                        warn!(session_id = %session.id, error = %e, "failed to evict artifacts")
                    }
                }
            }
        }
        evicted
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep_once().await;
                }
            }
        }
    }
}

/// Purges expired idempotency records and old delivered outbox rows.
pub struct MaintenanceSweep {
    store: Arc<dyn StateStore>,
    interval: Duration,
}

impl MaintenanceSweep {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            interval: Duration::from_secs(300),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn sweep_once(&self) {
        match self.store.purge_expired_idempotency().await {
            Ok(purged) if purged > 0 => debug!(purged, "purged expired idempotency records"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "idempotency purge failed"),
        }
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        match self.store.purge_delivered_outbox(cutoff).await {
            Ok(purged) if purged > 0 => debug!(purged, "purged delivered outbox rows"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "outbox purge failed"),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep_once().await;
                }
            }
        }
    }
}
