//! Pipeline supervision: spawn, monitor, classify, reap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use process_utils::{ExitOutcome, spawn_reaping_waiter};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::events::{EngineEvent, EventBus};
use crate::pipeline::{PipelineBackend, PipelineInput, PipelineSpec, PipelineState};
use crate::resolver::{PLAYLIST_NAME, playlist};
use crate::upstream::UpstreamClient;

/// Cap on retained child stderr.
const STDERR_TAIL_BYTES: usize = 4096;

/// Snapshot of a supervised pipeline.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub id: String,
    pub session_id: String,
    pub state: PipelineState,
    pub first_media_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
}

struct PipelineEntry {
    session_id: String,
    stop: CancellationToken,
    status: Arc<Mutex<PipelineStatus>>,
    done_rx: watch::Receiver<bool>,
}

/// Spawns and monitors one child per pipeline; guarantees no orphans survive
/// shutdown.
pub struct PipelineSupervisor {
    backend: Arc<dyn PipelineBackend>,
    upstream: Option<Arc<dyn UpstreamClient>>,
    bus: EventBus,
    stop_grace: Duration,
    poll_interval: Duration,
    pipelines: DashMap<String, Arc<PipelineEntry>>,
}

impl PipelineSupervisor {
    pub fn new(
        backend: Arc<dyn PipelineBackend>,
        upstream: Option<Arc<dyn UpstreamClient>>,
        bus: EventBus,
        stop_grace: Duration,
    ) -> Self {
        Self {
            backend,
            upstream,
            bus,
            stop_grace,
            poll_interval: Duration::from_millis(200),
            pipelines: DashMap::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Spawn a pipeline for the spec. Fails fast on a missing binary or a
    /// denied spec; artifact readiness is reported via bus events, not here.
    pub async fn start(&self, spec: PipelineSpec) -> Result<String> {
        tokio::fs::create_dir_all(&spec.output_dir)
            .await
            .map_err(|e| Error::Pipeline(format!("failed to create output dir: {e}")))?;

        let mut child = self.backend.spawn(&spec)?;
        let pipeline_id = uuid::Uuid::new_v4().to_string();

        let status = Arc::new(Mutex::new(PipelineStatus {
            id: pipeline_id.clone(),
            session_id: spec.session_id.clone(),
            state: PipelineState::Starting,
            first_media_at: None,
            exit_code: None,
            stderr_tail: String::new(),
        }));

        // Bounded stderr tail for diagnostics.
        if let Some(stderr) = child.stderr.take() {
            let status = status.clone();
            tokio::spawn(async move {
                let mut reader = stderr;
                let mut tail: Vec<u8> = Vec::with_capacity(STDERR_TAIL_BYTES);
                let mut buf = [0u8; 1024];
                while let Ok(n) = reader.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let cut = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..cut);
                    }
                }
                status.lock().stderr_tail = String::from_utf8_lossy(&tail).into_owned();
            });
        }

        let stop = CancellationToken::new();
        let waiter_rx =
            spawn_reaping_waiter(child, stop.clone(), self.backend.quit_bytes(), self.stop_grace);

        let (done_tx, done_rx) = watch::channel(false);
        let entry = Arc::new(PipelineEntry {
            session_id: spec.session_id.clone(),
            stop,
            status: status.clone(),
            done_rx,
        });
        self.pipelines.insert(pipeline_id.clone(), entry);

        info!(pipeline_id = %pipeline_id, session_id = %spec.session_id,
              backend = self.backend.name(), "pipeline started");
        self.bus.publish(EngineEvent::PipelineStarted {
            pipeline_id: pipeline_id.clone(),
            session_id: spec.session_id.clone(),
            timestamp: Utc::now(),
        });

        let bus = self.bus.clone();
        let upstream = self.upstream.clone();
        let poll_interval = self.poll_interval;
        let monitor_id = pipeline_id.clone();
        tokio::spawn(async move {
            Self::monitor(monitor_id, spec, status, waiter_rx, bus, upstream, poll_interval).await;
            let _ = done_tx.send(true);
        });

        Ok(pipeline_id)
    }

    async fn monitor(
        pipeline_id: String,
        spec: PipelineSpec,
        status: Arc<Mutex<PipelineStatus>>,
        mut waiter_rx: tokio::sync::oneshot::Receiver<ExitOutcome>,
        bus: EventBus,
        upstream: Option<Arc<dyn UpstreamClient>>,
        poll_interval: Duration,
    ) {
        let mut first_media = false;
        let mut segments_seen = 0usize;

        let outcome = loop {
            tokio::select! {
                outcome = &mut waiter_rx => {
                    break outcome.unwrap_or(ExitOutcome::Exited(Some(-1)));
                }
                _ = tokio::time::sleep(poll_interval) => {
                    let count = playlist::ready_segment_count(&spec.output_dir, PLAYLIST_NAME);
                    if count > 0 && !first_media {
                        first_media = true;
                        {
                            let mut status = status.lock();
                            status.state = PipelineState::Running;
                            status.first_media_at = Some(Utc::now());
                        }
                        debug!(pipeline_id = %pipeline_id, "first media observed");
                        bus.publish(EngineEvent::PipelineFirstMedia {
                            pipeline_id: pipeline_id.clone(),
                            session_id: spec.session_id.clone(),
                            timestamp: Utc::now(),
                        });
                    }
                    if count > segments_seen {
                        segments_seen = count;
                        bus.publish(EngineEvent::PipelineProgress {
                            pipeline_id: pipeline_id.clone(),
                            session_id: spec.session_id.clone(),
                            segments_written: count as u64,
                            timestamp: Utc::now(),
                        });
                    }
                }
            }
        };

        // A final playlist check closes the race between the last segment
        // write and the child exiting.
        if !first_media && playlist::playlist_ready(&spec.output_dir, PLAYLIST_NAME) {
            first_media = true;
            status.lock().first_media_at = Some(Utc::now());
            bus.publish(EngineEvent::PipelineFirstMedia {
                pipeline_id: pipeline_id.clone(),
                session_id: spec.session_id.clone(),
                timestamp: Utc::now(),
            });
        }

        let exit_code = outcome.code();
        status.lock().exit_code = exit_code;

        let clean_exit = exit_code == Some(0) || outcome.was_requested();
        if first_media || clean_exit {
            status.lock().state = PipelineState::Terminated;
            bus.publish(EngineEvent::PipelineTerminated {
                pipeline_id: pipeline_id.clone(),
                session_id: spec.session_id.clone(),
                exit_code,
                after_first_media: first_media,
                timestamp: Utc::now(),
            });
            return;
        }

        // Non-zero exit before first media: decide upstream vs. pipeline.
        let (kind, detail) = Self::classify_failure(&spec, exit_code, &status, upstream).await;
        warn!(pipeline_id = %pipeline_id, kind = %kind, detail = %detail, "pipeline failed");
        status.lock().state = PipelineState::Failed;
        bus.publish(EngineEvent::PipelineFailed {
            pipeline_id,
            session_id: spec.session_id.clone(),
            kind,
            detail,
            timestamp: Utc::now(),
        });
    }

    async fn classify_failure(
        spec: &PipelineSpec,
        exit_code: Option<i32>,
        status: &Arc<Mutex<PipelineStatus>>,
        upstream: Option<Arc<dyn UpstreamClient>>,
    ) -> (ErrorKind, String) {
        let tail = status.lock().stderr_tail.clone();
        let suffix = if tail.is_empty() {
            String::new()
        } else {
            format!("; stderr: {}", tail.trim_end())
        };

        if let Some(url) = spec.input.upstream_url()
            && let Some(upstream) = upstream
        {
            match upstream.head(url).await {
                Ok(code) if code >= 400 => {
                    return (
                        ErrorKind::UpstreamUnavailable,
                        format!("upstream returned {code}{suffix}"),
                    );
                }
                Err(e) => {
                    return (
                        ErrorKind::UpstreamUnavailable,
                        format!("upstream unreachable: {e}{suffix}"),
                    );
                }
                Ok(_) => {}
            }
        }

        let kind = match spec.input {
            PipelineInput::LocalFile(_) => ErrorKind::VodPlaybackError,
            PipelineInput::Upstream(_) => ErrorKind::InternalError,
        };
        (
            kind,
            format!("pipeline exited with {exit_code:?} before first media{suffix}"),
        )
    }

    /// Status snapshot for a pipeline.
    pub fn status(&self, pipeline_id: &str) -> Option<PipelineStatus> {
        self.pipelines
            .get(pipeline_id)
            .map(|entry| entry.status.lock().clone())
    }

    /// Pipelines not yet in a terminal state.
    pub fn running_count(&self) -> usize {
        self.pipelines
            .iter()
            .filter(|entry| !entry.status.lock().state.is_terminal())
            .count()
    }

    /// Stop a pipeline and wait for the child to be reaped. Idempotent;
    /// unknown ids are fine.
    pub async fn stop(&self, pipeline_id: &str) -> Result<()> {
        let Some(entry) = self.pipelines.get(pipeline_id).map(|e| Arc::clone(e.value())) else {
            return Ok(());
        };
        entry.stop.cancel();
        let mut done = entry.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        self.pipelines.remove(pipeline_id);
        debug!(pipeline_id = %pipeline_id, session_id = %entry.session_id, "pipeline reaped");
        Ok(())
    }

    /// Stop every pipeline; used on engine shutdown. No child survives this.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.pipelines.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(pipeline_id = %id, error = %e, "failed to stop pipeline on shutdown");
            }
        }
    }
}
