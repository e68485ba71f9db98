//! Session manager: the single authoritative state machine per session.
//!
//! Every mutation of a given session serializes through its lock; transitions
//! are persisted (with their bus events, atomically) before side effects
//! become visible. Cross-session operations run in parallel. The manager is
//! a cheap clone over shared internals so background tasks carry it by value.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{EngineEvent, EventBus, Topic};
use crate::lease::{AcquireOutcome, LeaseArbiter};
use crate::pipeline::{PipelineInput, PipelineSpec, PipelineSupervisor};
use crate::recording::RecordingService;
use crate::resolver::token::VerifiedDecision;
use crate::resolver::{ArtifactResolver, PLAYLIST_NAME, playlist};
use crate::session::entity::{
    IntentKind, PlayIntent, PlaybackMode, Session, SessionState, stop_reason,
};
use crate::store::{IdempotencyOutcome, StateStore};
use crate::upstream::UpstreamClient;

/// Session manager tuning, lifted from the application config.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_deadline_window: Duration,
    pub session_ttl: Duration,
    pub startup_budget: Duration,
    pub idempotency_ttl: Duration,
}

impl SessionManagerConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_deadline_window: config.heartbeat_deadline_window(),
            session_ttl: config.session_ttl,
            startup_budget: config.startup_budget,
            idempotency_ttl: config.idempotency_ttl,
        }
    }
}

/// Heartbeat result: the advanced deadlines.
#[derive(Debug, Clone)]
pub struct HeartbeatSnapshot {
    pub heartbeat_deadline: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub heartbeat_interval_seconds: u64,
}

struct Inner {
    store: Arc<dyn StateStore>,
    arbiter: Arc<LeaseArbiter>,
    supervisor: Arc<PipelineSupervisor>,
    resolver: Arc<ArtifactResolver>,
    recordings: Arc<RecordingService>,
    upstream: Arc<dyn UpstreamClient>,
    bus: EventBus,
    config: SessionManagerConfig,
    /// Per-session serialization domain.
    locks: DashMap<String, Arc<Mutex<()>>>,
    accepting: AtomicBool,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        arbiter: Arc<LeaseArbiter>,
        supervisor: Arc<PipelineSupervisor>,
        resolver: Arc<ArtifactResolver>,
        recordings: Arc<RecordingService>,
        upstream: Arc<dyn UpstreamClient>,
        bus: EventBus,
        config: SessionManagerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                arbiter,
                supervisor,
                resolver,
                recordings,
                upstream,
                bus,
                config,
                locks: DashMap::new(),
                accepting: AtomicBool::new(true),
                cancel,
            }),
        }
    }

    pub fn heartbeat_interval_seconds(&self) -> u64 {
        self.inner.config.heartbeat_interval.as_secs()
    }

    pub fn session_ttl(&self) -> Duration {
        self.inner.config.session_ttl
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Canonical fingerprint of an intent payload, for idempotency
    /// comparison.
    pub fn payload_fingerprint(intent: &PlayIntent) -> String {
        let mut hasher = Sha256::new();
        hasher.update(match intent.kind {
            IntentKind::Live => b"live".as_slice(),
            IntentKind::Recording => b"recording".as_slice(),
        });
        hasher.update(b"|");
        hasher.update(intent.target.as_bytes());
        hasher.update(b"|");
        hasher.update(intent.profile.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn transition_event(
        session: &Session,
        from: SessionState,
        reason: Option<String>,
    ) -> EngineEvent {
        EngineEvent::SessionTransitioned {
            session_id: session.id.clone(),
            from,
            to: session.state,
            reason,
            timestamp: Utc::now(),
        }
    }

    fn deadline_from_now(&self) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.inner.config.heartbeat_deadline_window)
                .unwrap_or_default()
    }

    /// Create a session for an intent: token check, idempotency, lease
    /// acquisition, then the startup task. Never waits for readiness.
    pub async fn create(
        &self,
        intent: PlayIntent,
        idem_key: Option<String>,
        decision_token: &str,
    ) -> Result<Session> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::engine(
                ErrorKind::Preparing,
                "engine is shutting down",
            ));
        }
        if decision_token.is_empty() {
            return Err(Error::precondition("decision token required"));
        }
        let decision = self
            .inner
            .resolver
            .verify_token(decision_token, &intent.target)?;
        if decision.mode == PlaybackMode::Deny {
            return Err(Error::engine(
                ErrorKind::PolicyDeniesTranscode,
                "decision denies playback",
            ));
        }

        let fingerprint = Self::payload_fingerprint(&intent);

        // Replay fast path.
        if let Some(key) = idem_key.as_deref()
            && let Some(record) = self.inner.store.get_idempotency(key).await?
        {
            if record.fingerprint == fingerprint {
                return self
                    .inner
                    .store
                    .get_session(&record.session_id)
                    .await?
                    .ok_or_else(|| Error::not_found("sessions", &record.session_id));
            }
            return Err(Error::engine(
                ErrorKind::IdempotentReplay,
                "idempotency key reused with a different payload",
            ));
        }

        let session_id = uuid::Uuid::new_v4().to_string();

        // Lease before the session row: a refusal burns nothing.
        let lease = match self
            .inner
            .arbiter
            .try_acquire(&intent.target, &session_id)
            .await?
        {
            AcquireOutcome::Acquired(lease) => lease,
            AcquireOutcome::Exhausted => {
                return Err(Error::lease_busy("all tuner slots in use"));
            }
        };

        let mut session = Session::new(session_id.clone(), intent.clone(), self.deadline_from_now());
        session.lease_id = Some(lease.id.clone());
        session.decision_token = Some(decision_token.to_string());
        session.playback_mode = Some(decision.mode);
        session.idem_key = idem_key.clone();
        session.payload_fingerprint = Some(fingerprint.clone());

        match idem_key.as_deref() {
            Some(key) => {
                match self
                    .inner
                    .store
                    .put_session_with_idempotency(
                        &session,
                        key,
                        &fingerprint,
                        self.inner.config.idempotency_ttl,
                    )
                    .await?
                {
                    IdempotencyOutcome::Created => {}
                    IdempotencyOutcome::Replayed(record) => {
                        // Lost a race on the same key; hand the slot back.
                        self.inner.arbiter.release(&lease.id, &session_id).await?;
                        if record.fingerprint == fingerprint {
                            return self
                                .inner
                                .store
                                .get_session(&record.session_id)
                                .await?
                                .ok_or_else(|| {
                                    Error::not_found("sessions", &record.session_id)
                                });
                        }
                        return Err(Error::engine(
                            ErrorKind::IdempotentReplay,
                            "idempotency key reused with a different payload",
                        ));
                    }
                }
            }
            None => self.inner.store.put_session(&session).await?,
        }

        // Lease acquisition success is what moves NEW forward.
        let session = self
            .inner
            .store
            .update_session(&session_id, &mut |s| {
                let from = s.state;
                s.transition(SessionState::Starting)?;
                Ok(vec![Self::transition_event(s, from, None)])
            })
            .await?;

        info!(session_id = %session_id, target = %intent.target, "session created");
        let manager = self.clone();
        let startup_session = session.clone();
        tokio::spawn(async move {
            manager.run_startup(startup_session, decision).await;
        });
        Ok(session)
    }

    /// Session snapshot.
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        self.inner
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::not_found("sessions", session_id))
    }

    /// All session snapshots (admin surface).
    pub async fn list(&self) -> Result<Vec<Session>> {
        self.inner.store.scan_sessions().await
    }

    /// Advance the heartbeat deadline and renew the lease. Terminal sessions
    /// report `SESSION_GONE`; the adapter turns that into 410.
    pub async fn heartbeat(&self, session_id: &str) -> Result<HeartbeatSnapshot> {
        let lock = self.lock_for(session_id);
        let guard = lock.lock().await;

        let session = self.get(session_id).await?;
        if session.is_terminal() {
            return Err(Error::session_gone("session is terminal"));
        }

        let deadline = self.deadline_from_now();
        let session = self
            .inner
            .store
            .update_session(session_id, &mut |s| {
                s.heartbeat_deadline = deadline;
                Ok(Vec::new())
            })
            .await?;

        let mut lease_expires_at = None;
        if let Some(lease_id) = session.lease_id.as_deref() {
            match self.inner.arbiter.renew(lease_id, session_id).await {
                Ok(lease) => lease_expires_at = Some(lease.expires_at),
                Err(renew_err) => {
                    // Expired leases must be re-acquired, never extended.
                    debug!(session_id = %session_id, error = %renew_err,
                           "lease renew failed; attempting re-acquire");
                    match self
                        .inner
                        .arbiter
                        .try_acquire(&session.intent.target, session_id)
                        .await?
                    {
                        AcquireOutcome::Acquired(lease) => {
                            lease_expires_at = Some(lease.expires_at);
                            let lease_id = lease.id.clone();
                            self.inner
                                .store
                                .update_session(session_id, &mut |s| {
                                    s.lease_id = Some(lease_id.clone());
                                    Ok(Vec::new())
                                })
                                .await?;
                        }
                        AcquireOutcome::Exhausted => {
                            drop(guard);
                            self.fail(session_id, ErrorKind::LeaseBusy, "lease lost and slots exhausted")
                                .await?;
                            return Err(Error::lease_busy("lease lost and slots exhausted"));
                        }
                    }
                }
            }
        }

        Ok(HeartbeatSnapshot {
            heartbeat_deadline: deadline,
            lease_expires_at,
            heartbeat_interval_seconds: self.inner.config.heartbeat_interval.as_secs(),
        })
    }

    /// Stop a session. Idempotent: unknown and already-terminal sessions are
    /// fine. The lease is released strictly after the pipeline is reaped.
    pub async fn stop(&self, session_id: &str, reason: &str) -> Result<()> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let Some(session) = self.inner.store.get_session(session_id).await? else {
            return Ok(());
        };
        if session.is_terminal() {
            return Ok(());
        }

        let pipeline_id = session.pipeline_id.clone();
        let lease_id = session.lease_id.clone();
        let reason_owned = reason.to_string();

        self.inner
            .store
            .update_session(session_id, &mut |s| {
                let from = s.state;
                s.stop_reason = Some(reason_owned.clone());
                s.transition(SessionState::Stopping)?;
                Ok(vec![Self::transition_event(s, from, Some(reason_owned.clone()))])
            })
            .await?;

        if let Some(pipeline_id) = pipeline_id.as_deref() {
            self.inner.supervisor.stop(pipeline_id).await?;
        }
        if let Some(lease_id) = lease_id.as_deref() {
            self.inner.arbiter.release(lease_id, session_id).await?;
        }

        self.inner
            .store
            .update_session(session_id, &mut |s| {
                let from = s.state;
                s.transition(SessionState::Stopped)?;
                Ok(vec![Self::transition_event(s, from, Some(reason_owned.clone()))])
            })
            .await?;

        info!(session_id = %session_id, reason = %reason, "session stopped");
        Ok(())
    }

    /// Fail a session with a structured cause, releasing its resources. The
    /// pipeline is reaped before the lease goes back.
    pub async fn fail(&self, session_id: &str, kind: ErrorKind, detail: &str) -> Result<()> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let Some(session) = self.inner.store.get_session(session_id).await? else {
            return Ok(());
        };
        if session.is_terminal() {
            return Ok(());
        }
        let pipeline_id = session.pipeline_id.clone();
        let lease_id = session.lease_id.clone();

        let detail_owned = detail.to_string();
        self.inner
            .store
            .update_session(session_id, &mut |s| {
                let from = s.state;
                s.fail(kind, detail_owned.clone())?;
                Ok(vec![Self::transition_event(
                    s,
                    from,
                    Some(format!("{kind}/{detail_owned}")),
                )])
            })
            .await?;

        if let Some(pipeline_id) = pipeline_id.as_deref() {
            self.inner.supervisor.stop(pipeline_id).await?;
        }
        if let Some(lease_id) = lease_id.as_deref() {
            self.inner.arbiter.release(lease_id, session_id).await?;
        }
        warn!(session_id = %session_id, kind = %kind, detail = %detail, "session failed");
        Ok(())
    }

    /// Startup task: build the pipeline, gate readiness on first media plus
    /// a servable playlist, then watch the pipeline to its end.
    async fn run_startup(&self, session: Session, decision: VerifiedDecision) {
        let session_id = session.id.clone();
        // Subscribe before the pipeline exists so no event is missed.
        let mut events = self.inner.bus.subscribe(Topic::Pipeline);

        let input = match self.build_input(&session).await {
            Ok(input) => input,
            Err(e) => {
                let _ = self.fail(&session_id, e.kind(), &e.to_string()).await;
                return;
            }
        };

        let spec = PipelineSpec {
            session_id: session_id.clone(),
            input,
            output_dir: self.inner.resolver.session_dir(&session_id),
            strategy: decision.strategy,
            target_codec: decision.target_codec.clone(),
        };
        let output_dir = spec.output_dir.clone();

        let pipeline_id = match self.inner.supervisor.start(spec).await {
            Ok(id) => id,
            Err(e) => {
                let _ = self.fail(&session_id, e.kind(), &e.to_string()).await;
                return;
            }
        };
        if let Err(e) = self
            .inner
            .store
            .update_session(&session_id, &mut |s| {
                s.pipeline_id = Some(pipeline_id.clone());
                Ok(Vec::new())
            })
            .await
        {
            warn!(session_id = %session_id, error = %e, "failed to persist pipeline handle");
        }

        let deadline = tokio::time::sleep(self.inner.config.startup_budget);
        tokio::pin!(deadline);
        let mut ready = false;

        loop {
            tokio::select! {
                _ = &mut deadline, if !ready => {
                    let _ = self.inner.supervisor.stop(&pipeline_id).await;
                    let _ = self
                        .fail(&session_id, ErrorKind::UpstreamTimeout, "startup budget exceeded")
                        .await;
                    return;
                }
                _ = self.inner.cancel.cancelled() => {
                    return;
                }
                event = events.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(_) => continue,
                    };
                    if event.entity_id() != session_id {
                        continue;
                    }
                    match event {
                        EngineEvent::PipelineFirstMedia { .. } => {
                            if !ready
                                && playlist::playlist_ready(&output_dir, PLAYLIST_NAME)
                                && self.mark_ready(&session).await.is_ok()
                            {
                                ready = true;
                            }
                        }
                        EngineEvent::PipelineFailed { kind, detail, .. } => {
                            let _ = self.fail(&session_id, kind, &detail).await;
                            return;
                        }
                        EngineEvent::PipelineTerminated { after_first_media, exit_code, .. } => {
                            if !after_first_media && !ready {
                                let _ = self
                                    .fail(
                                        &session_id,
                                        ErrorKind::VodPlaybackError,
                                        &format!("pipeline ended with {exit_code:?} before media"),
                                    )
                                    .await;
                                return;
                            }
                            if !ready && playlist::playlist_ready(&output_dir, PLAYLIST_NAME) {
                                ready = self.mark_ready(&session).await.is_ok();
                            }
                            self.on_pipeline_drained(&session).await;
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn build_input(&self, session: &Session) -> Result<PipelineInput> {
        match session.intent.kind {
            IntentKind::Live => {
                let url = self.inner.upstream.stream_url(&session.intent.target).await?;
                Ok(PipelineInput::Upstream(url))
            }
            IntentKind::Recording => {
                let path = self.inner.resolver.recording_path(&session.intent.target)?;
                if !path.is_file() {
                    return Err(Error::engine(
                        ErrorKind::VodNotFound,
                        "recording file missing",
                    ));
                }
                Ok(PipelineInput::LocalFile(path))
            }
        }
    }

    /// STARTING → READY with the playback URL.
    ///
    /// For recordings the artifact metadata is written first, so a client
    /// that observes READY can immediately fetch the recording playlist.
    async fn mark_ready(&self, session: &Session) -> Result<()> {
        let lock = self.lock_for(&session.id);
        let _guard = lock.lock().await;

        let live = session.intent.kind == IntentKind::Live;
        if !live {
            let dir = self.inner.resolver.session_dir(&session.id);
            let playlist_path = dir.join(PLAYLIST_NAME);
            self.inner
                .recordings
                .mark_prepared(
                    &session.intent.target,
                    &playlist_path.to_string_lossy(),
                    artifact_bytes(&dir),
                )
                .await?;
        }

        let url = self
            .inner
            .resolver
            .playback_url(&session.id, &session.intent.target, live);
        self.inner
            .store
            .update_session(&session.id, &mut |s| {
                if s.state != SessionState::Starting {
                    return Ok(Vec::new());
                }
                let from = s.state;
                s.playback_url = Some(url.clone());
                s.transition(SessionState::Ready)?;
                Ok(vec![Self::transition_event(s, from, None)])
            })
            .await?;
        info!(session_id = %session.id, "session ready");
        Ok(())
    }

    /// The pipeline ended after first media: finalize (recording) or end the
    /// session (live).
    async fn on_pipeline_drained(&self, session: &Session) {
        match session.intent.kind {
            IntentKind::Recording => {
                let dir = self.inner.resolver.session_dir(&session.id);
                let playlist_path = dir.join(PLAYLIST_NAME);
                if let Err(e) = self
                    .inner
                    .recordings
                    .mark_prepared(
                        &session.intent.target,
                        &playlist_path.to_string_lossy(),
                        artifact_bytes(&dir),
                    )
                    .await
                {
                    warn!(session_id = %session.id, error = %e,
                          "failed to finalize recording artifacts");
                }
                // The session keeps serving the finished artifacts; only the
                // pipeline handle goes away.
                let _ = self
                    .inner
                    .store
                    .update_session(&session.id, &mut |s| {
                        s.pipeline_id = None;
                        Ok(Vec::new())
                    })
                    .await;
            }
            IntentKind::Live => {
                if let Err(e) = self.stop(&session.id, stop_reason::PIPELINE_ENDED).await {
                    warn!(session_id = %session.id, error = %e, "failed to end live session");
                }
            }
        }
    }

    /// Startup crash recovery: sessions persisted in non-terminal states have
    /// lost their pipelines with the process. Live sessions fail with
    /// `RESTART_LOST`; recording sessions with intact artifacts get their
    /// recording metadata re-probed and a fresh lease instead.
    pub async fn recover_on_startup(&self) -> Result<()> {
        for session in self.inner.store.scan_sessions().await? {
            if session.is_terminal() {
                continue;
            }
            let dir = self.inner.resolver.session_dir(&session.id);
            let recording_intact = session.intent.kind == IntentKind::Recording
                && session.state == SessionState::Ready
                && playlist::playlist_ready(&dir, PLAYLIST_NAME);

            if recording_intact {
                let playlist_path = dir.join(PLAYLIST_NAME);
                self.inner
                    .recordings
                    .mark_prepared(
                        &session.intent.target,
                        &playlist_path.to_string_lossy(),
                        artifact_bytes(&dir),
                    )
                    .await?;
                if let Ok(path) = self.inner.resolver.recording_path(&session.intent.target)
                    && path.is_file()
                {
                    // Re-probe; a container duration finalizes the meta.
                    let _ = self
                        .inner
                        .resolver
                        .duration()
                        .probe_recording(&session.intent.target, &path.to_string_lossy())
                        .await;
                }
                // Leases were dropped on startup and READY requires one.
                match self
                    .inner
                    .arbiter
                    .try_acquire(&session.intent.target, &session.id)
                    .await?
                {
                    AcquireOutcome::Acquired(lease) => {
                        let lease_id = lease.id;
                        self.inner
                            .store
                            .update_session(&session.id, &mut |s| {
                                s.lease_id = Some(lease_id.clone());
                                s.pipeline_id = None;
                                Ok(Vec::new())
                            })
                            .await?;
                        info!(session_id = %session.id, "recording session recovered");
                        continue;
                    }
                    AcquireOutcome::Exhausted => {}
                }
            }

            self.fail(&session.id, ErrorKind::SessionGone, "RESTART_LOST")
                .await?;
        }
        Ok(())
    }

    /// Graceful shutdown: stop accepting intents, stop sessions, drain
    /// pipelines within the deadline, then force-kill survivors.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let sessions = match self.inner.store.scan_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "failed to scan sessions for shutdown");
                Vec::new()
            }
        };
        let stop_all = async {
            for session in sessions.iter().filter(|s| !s.is_terminal()) {
                if let Err(e) = self.stop(&session.id, stop_reason::SHUTDOWN).await {
                    warn!(session_id = %session.id, error = %e, "failed to stop session");
                }
            }
        };
        if tokio::time::timeout(grace, stop_all).await.is_err() {
            warn!("graceful shutdown deadline exceeded; forcing pipeline termination");
        }
        self.inner.supervisor.shutdown().await;
    }
}

/// Total size of artifacts in a session directory.
fn artifact_bytes(dir: &std::path::Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipeline::PipelineBackend;
    use crate::recording::DurationPolicy;
    use crate::resolver::decision;
    use crate::resolver::duration::{DurationService, MediaProber, ProbeSource};
    use crate::resolver::token::DecisionTokenSigner;
    use crate::store::memory::MemoryStore;
    use crate::upstream::MockUpstream;
    use std::process::Stdio;

    struct ScriptBackend {
        script: String,
    }

    impl PipelineBackend for ScriptBackend {
        fn name(&self) -> &'static str {
            "script"
        }

        fn spawn(&self, spec: &crate::pipeline::PipelineSpec) -> Result<tokio::process::Child> {
            process_utils::tokio_command("sh")
                .arg("-c")
                .arg(&self.script)
                .env("OUT", &spec.output_dir)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| Error::Pipeline(e.to_string()))
        }
    }

    struct StaticProber;

    #[async_trait::async_trait]
    impl MediaProber for StaticProber {
        async fn probe(&self, _source: &ProbeSource) -> Result<decision::MediaInfo> {
            Ok(decision::MediaInfo {
                container: "mpegts".into(),
                video_codec: "h264".into(),
                audio_codec: "aac".into(),
                duration_seconds: Some(60.0),
            })
        }
    }

    const WRITE_MEDIA_AND_RUN: &str = r#"
        printf 'x' > "$OUT/seg_00000.ts"
        printf '#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg_00000.ts\n' > "$OUT/index.m3u8"
        sleep 60
    "#;

    struct Harness {
        manager: SessionManager,
        resolver: Arc<ArtifactResolver>,
        store: Arc<dyn StateStore>,
        _hls: tempfile::TempDir,
        _recordings: tempfile::TempDir,
    }

    fn harness(script: &str, slots: usize, startup_budget: Duration) -> Harness {
        let hls = tempfile::tempdir().unwrap();
        let recordings_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let upstream: Arc<dyn UpstreamClient> = Arc::new(MockUpstream::new());

        let arbiter = Arc::new(LeaseArbiter::new(
            store.clone(),
            slots,
            Duration::from_secs(60),
        ));
        let recordings = Arc::new(RecordingService::new(
            store.clone(),
            DurationPolicy {
                min_delta: Duration::from_secs(2),
                index_final: false,
            },
        ));
        let duration = Arc::new(DurationService::new(
            recordings.clone(),
            Arc::new(StaticProber),
            Duration::from_secs(10),
        ));
        let resolver = Arc::new(ArtifactResolver::new(
            hls.path().to_path_buf(),
            recordings_dir.path().to_path_buf(),
            String::new(),
            decision::default_profiles(),
            DecisionTokenSigner::new("manager-test", Duration::from_secs(60)),
            duration,
            recordings.clone(),
        ));
        let supervisor = Arc::new(
            crate::pipeline::PipelineSupervisor::new(
                Arc::new(ScriptBackend {
                    script: script.to_string(),
                }),
                Some(upstream.clone()),
                bus.clone(),
                Duration::from_millis(200),
            )
            .with_poll_interval(Duration::from_millis(20)),
        );

        let manager = SessionManager::new(
            store.clone(),
            arbiter,
            supervisor,
            resolver.clone(),
            recordings,
            upstream,
            bus,
            SessionManagerConfig {
                heartbeat_interval: Duration::from_secs(30),
                heartbeat_deadline_window: Duration::from_secs(60),
                session_ttl: Duration::from_secs(3600),
                startup_budget,
                idempotency_ttl: Duration::from_secs(600),
            },
            CancellationToken::new(),
        );

        Harness {
            manager,
            resolver,
            store,
            _hls: hls,
            _recordings: recordings_dir,
        }
    }

    fn live_token(harness: &Harness, service_ref: &str) -> String {
        harness
            .resolver
            .stream_info_live(service_ref, "native_hls")
            .unwrap()
            .token
    }

    async fn wait_for_state(
        harness: &Harness,
        session_id: &str,
        state: SessionState,
    ) -> Session {
        for _ in 0..200 {
            let session = harness.manager.get(session_id).await.unwrap();
            if session.state == state {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("session never reached {state}");
    }

    #[tokio::test]
    async fn create_requires_a_decision_token() {
        let harness = harness(WRITE_MEDIA_AND_RUN, 1, Duration::from_secs(5));
        let err = harness
            .manager
            .create(PlayIntent::live("1:0:1:A", "native_hls"), None, "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

        // A token for a different target is refused too.
        let token = live_token(&harness, "1:0:1:B");
        let err = harness
            .manager
            .create(PlayIntent::live("1:0:1:A", "native_hls"), None, &token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn session_becomes_ready_and_holds_the_invariant() {
        let harness = harness(WRITE_MEDIA_AND_RUN, 1, Duration::from_secs(10));
        let token = live_token(&harness, "1:0:1:A");
        let session = harness
            .manager
            .create(PlayIntent::live("1:0:1:A", "native_hls"), None, &token)
            .await
            .unwrap();
        assert_eq!(session.state, SessionState::Starting);

        let ready = wait_for_state(&harness, &session.id, SessionState::Ready).await;
        assert!(ready.ready_invariant_holds());
        assert!(ready.playback_url.as_deref().unwrap().contains(&session.id));

        harness
            .manager
            .stop(&session.id, stop_reason::CLIENT_STOP)
            .await
            .unwrap();
        let stopped = harness.manager.get(&session.id).await.unwrap();
        assert_eq!(stopped.state, SessionState::Stopped);
        assert!(stopped.lease_id.is_none());
        assert!(stopped.pipeline_id.is_none());
        // Idempotent.
        harness
            .manager
            .stop(&session.id, stop_reason::CLIENT_STOP)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lease_exhaustion_refuses_the_second_session() {
        let harness = harness(WRITE_MEDIA_AND_RUN, 1, Duration::from_secs(10));
        let token = live_token(&harness, "1:0:1:A");
        harness
            .manager
            .create(PlayIntent::live("1:0:1:A", "native_hls"), None, &token)
            .await
            .unwrap();

        let token = live_token(&harness, "1:0:1:B");
        let err = harness
            .manager
            .create(PlayIntent::live("1:0:1:B", "native_hls"), None, &token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseBusy);
    }

    #[tokio::test]
    async fn idempotent_replay_semantics() {
        let harness = harness(WRITE_MEDIA_AND_RUN, 2, Duration::from_secs(10));
        let token = live_token(&harness, "1:0:1:A");
        let first = harness
            .manager
            .create(
                PlayIntent::live("1:0:1:A", "native_hls"),
                Some("k-1".into()),
                &token,
            )
            .await
            .unwrap();

        // Same key, same payload: the original session verbatim.
        let token = live_token(&harness, "1:0:1:A");
        let replay = harness
            .manager
            .create(
                PlayIntent::live("1:0:1:A", "native_hls"),
                Some("k-1".into()),
                &token,
            )
            .await
            .unwrap();
        assert_eq!(first.id, replay.id);

        // Same key, different payload: conflict.
        let token = live_token(&harness, "1:0:1:B");
        let err = harness
            .manager
            .create(
                PlayIntent::live("1:0:1:B", "native_hls"),
                Some("k-1".into()),
                &token,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IdempotentReplay);
    }

    #[tokio::test]
    async fn startup_budget_fails_the_session() {
        // Script never writes media.
        let harness = harness("sleep 60", 1, Duration::from_millis(300));
        let token = live_token(&harness, "1:0:1:A");
        let session = harness
            .manager
            .create(PlayIntent::live("1:0:1:A", "native_hls"), None, &token)
            .await
            .unwrap();

        let failed = wait_for_state(&harness, &session.id, SessionState::Failed).await;
        let error = failed.last_error.unwrap();
        assert_eq!(error.kind, ErrorKind::UpstreamTimeout);
        assert!(failed.lease_id.is_none());
    }

    #[tokio::test]
    async fn pipeline_failure_before_media_fails_the_session() {
        let harness = harness("exit 3", 1, Duration::from_secs(10));
        let token = live_token(&harness, "1:0:1:A");
        let session = harness
            .manager
            .create(PlayIntent::live("1:0:1:A", "native_hls"), None, &token)
            .await
            .unwrap();

        let failed = wait_for_state(&harness, &session.id, SessionState::Failed).await;
        assert!(failed.last_error.is_some());
        // The lease is back; a new session can start.
        let token = live_token(&harness, "1:0:1:B");
        assert!(
            harness
                .manager
                .create(PlayIntent::live("1:0:1:B", "native_hls"), None, &token)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn heartbeat_on_terminal_session_is_gone() {
        let harness = harness("exit 0", 1, Duration::from_secs(10));
        let token = live_token(&harness, "1:0:1:A");
        let session = harness
            .manager
            .create(PlayIntent::live("1:0:1:A", "native_hls"), None, &token)
            .await
            .unwrap();
        wait_for_state(&harness, &session.id, SessionState::Failed).await;

        let err = harness.manager.heartbeat(&session.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionGone);
    }

    #[tokio::test]
    async fn heartbeat_advances_the_deadline() {
        let harness = harness(WRITE_MEDIA_AND_RUN, 1, Duration::from_secs(10));
        let token = live_token(&harness, "1:0:1:A");
        let session = harness
            .manager
            .create(PlayIntent::live("1:0:1:A", "native_hls"), None, &token)
            .await
            .unwrap();
        wait_for_state(&harness, &session.id, SessionState::Ready).await;

        let first = harness.manager.heartbeat(&session.id).await.unwrap();
        let second = harness.manager.heartbeat(&session.id).await.unwrap();
        // Heartbeats within one interval are idempotent: the extension is
        // the same window, not cumulative.
        assert!(second.heartbeat_deadline >= first.heartbeat_deadline);
        assert!(
            (second.heartbeat_deadline - first.heartbeat_deadline).num_seconds() < 2,
            "extension must not accumulate"
        );
        assert!(second.lease_expires_at.is_some());
    }

    #[tokio::test]
    async fn restart_recovery_fails_live_sessions() {
        let harness = harness(WRITE_MEDIA_AND_RUN, 1, Duration::from_secs(10));
        // A session persisted mid-startup by a previous process.
        let mut orphan = Session::new(
            "s-orphan",
            PlayIntent::live("1:0:1:A", "native_hls"),
            Utc::now(),
        );
        orphan.transition(SessionState::Starting).unwrap();
        harness.store.put_session(&orphan).await.unwrap();

        harness.manager.recover_on_startup().await.unwrap();
        let recovered = harness.manager.get("s-orphan").await.unwrap();
        assert_eq!(recovered.state, SessionState::Failed);
        assert_eq!(
            recovered.last_error.as_ref().unwrap().detail,
            "RESTART_LOST"
        );
    }
}
