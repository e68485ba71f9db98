//! Service container: the single composition root.
//!
//! Builds the component graph leaves-first (store → bus → arbiter →
//! recording FSM → pipeline supervisor → resolver → session manager →
//! dispatcher → HTTP adapter) and owns lifecycle: initialize, serve,
//! shutdown. Nothing pulls dependencies from globals.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::auth::AuthConfig;
use crate::api::server::{ApiServer, ApiServerConfig, AppState};
use crate::config::AppConfig;
use crate::error::Result;
use crate::events::{EventBus, OutboxRelay};
use crate::health::HealthChecker;
use crate::intents::IntentDispatcher;
use crate::lease::LeaseArbiter;
use crate::pipeline::{FfmpegBackend, PipelineBackend, PipelineSupervisor};
use crate::recording::{DurationPolicy, RecordingService};
use crate::resolver::decision::{self, ClientProfile};
use crate::resolver::duration::{DurationService, FfprobeProber, MediaProber};
use crate::resolver::token::DecisionTokenSigner;
use crate::resolver::ArtifactResolver;
use crate::session::manager::{SessionManager, SessionManagerConfig};
use crate::session::reaper::{CacheEvicter, MaintenanceSweep, SessionReaper};
use crate::store::StateStore;
use crate::store::sqlite::{SqliteStore, create_pool};
use crate::upstream::{OpenWebIfClient, UpstreamClient};

/// Service container holding the full component graph.
pub struct ServiceContainer {
    pub config: AppConfig,
    pub store: Arc<dyn StateStore>,
    pub bus: EventBus,
    pub arbiter: Arc<LeaseArbiter>,
    pub recordings: Arc<RecordingService>,
    pub supervisor: Arc<PipelineSupervisor>,
    pub resolver: Arc<ArtifactResolver>,
    pub sessions: SessionManager,
    pub dispatcher: Arc<IntentDispatcher>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub health: Arc<HealthChecker>,
    start_time: Instant,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Production wiring: SQLite store, OpenWebIF upstream, FFmpeg pipeline
    /// backend, ffprobe prober.
    pub async fn new(config: AppConfig) -> Result<Self> {
        let pool = create_pool(&config.database_url).await?;
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::new(pool));
        let upstream: Arc<dyn UpstreamClient> =
            Arc::new(OpenWebIfClient::new(&config.openwebif_url)?);
        let backend: Arc<dyn PipelineBackend> =
            Arc::new(FfmpegBackend::new(config.ffmpeg_path.clone()));
        let prober: Arc<dyn MediaProber> =
            Arc::new(FfprobeProber::new(config.ffprobe_path.clone()));
        Self::wire(config, store, upstream, backend, prober)
    }

    /// Wire the graph from explicit leaves. Tests inject in-memory stores,
    /// mock upstreams, and scriptable backends through here.
    pub fn wire(
        config: AppConfig,
        store: Arc<dyn StateStore>,
        upstream: Arc<dyn UpstreamClient>,
        backend: Arc<dyn PipelineBackend>,
        prober: Arc<dyn MediaProber>,
    ) -> Result<Self> {
        info!("wiring services");
        let cancellation_token = CancellationToken::new();
        let bus = EventBus::new();

        let arbiter = Arc::new(LeaseArbiter::new(
            store.clone(),
            config.tuner_slots,
            config.lease_ttl,
        ));

        let recordings = Arc::new(RecordingService::new(
            store.clone(),
            DurationPolicy {
                min_delta: config.min_duration_delta,
                index_final: config.index_duration_final,
            },
        ));

        let duration = Arc::new(DurationService::new(
            recordings.clone(),
            prober,
            config.probe_budget,
        ));

        let resolver = Arc::new(ArtifactResolver::new(
            config.hls_root.clone(),
            config.recordings_dir.clone(),
            config.public_base_url.clone(),
            load_profiles()?,
            DecisionTokenSigner::new(&config.token_secret, config.token_freshness),
            duration,
            recordings.clone(),
        ));

        let supervisor = Arc::new(PipelineSupervisor::new(
            backend,
            Some(upstream.clone()),
            bus.clone(),
            config.stop_grace,
        ));

        let sessions = SessionManager::new(
            store.clone(),
            arbiter.clone(),
            supervisor.clone(),
            resolver.clone(),
            recordings.clone(),
            upstream.clone(),
            bus.clone(),
            SessionManagerConfig::from_app(&config),
            cancellation_token.clone(),
        );

        let dispatcher = Arc::new(IntentDispatcher::new(sessions.clone()));
        let health = Arc::new(HealthChecker::new(store.clone(), upstream.clone()));

        Ok(Self {
            config,
            store,
            bus,
            arbiter,
            recordings,
            supervisor,
            resolver,
            sessions,
            dispatcher,
            upstream,
            health,
            start_time: Instant::now(),
            cancellation_token,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Bring the engine up: reset leases, recover persisted sessions, start
    /// the background tasks.
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.hls_root).await?;

        // Clean startup never trusts persisted leases.
        self.arbiter.drop_all().await?;
        self.sessions.recover_on_startup().await?;

        let relay = OutboxRelay::new(self.store.clone(), self.bus.clone());
        tokio::spawn(relay.run(self.cancellation_token.clone()));

        let reaper_interval =
            (self.config.heartbeat_interval / 2).max(std::time::Duration::from_secs(1));
        let reaper = SessionReaper::new(self.sessions.clone(), reaper_interval);
        tokio::spawn(reaper.run(self.cancellation_token.clone()));

        let evicter = CacheEvicter::new(
            self.store.clone(),
            self.config.hls_root.clone(),
            self.config.evict_grace,
        );
        tokio::spawn(evicter.run(self.cancellation_token.clone()));

        let sweep = MaintenanceSweep::new(self.store.clone());
        tokio::spawn(sweep.run(self.cancellation_token.clone()));

        info!("services initialized");
        Ok(())
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            start_time: self.start_time,
            dispatcher: self.dispatcher.clone(),
            sessions: self.sessions.clone(),
            resolver: self.resolver.clone(),
            recordings: self.recordings.clone(),
            arbiter: self.arbiter.clone(),
            upstream: self.upstream.clone(),
            health: self.health.clone(),
            auth: AuthConfig::new(&self.config.api_tokens),
        }
    }

    /// Spawn the API server; it stops when the container shuts down.
    pub fn start_api_server(&self) {
        let server = ApiServer::new(
            ApiServerConfig {
                bind_address: self.config.bind_address.clone(),
                port: self.config.port,
                enable_cors: true,
            },
            self.app_state(),
            self.cancellation_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                warn!(error = %e, "API server exited");
            }
        });
    }

    /// Graceful shutdown: sessions drain within the deadline, every pipeline
    /// child is reaped, then the background tasks stop.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.sessions.shutdown(self.config.shutdown_grace).await;
        self.cancellation_token.cancel();
        info!("shutdown complete");
    }
}

fn load_profiles() -> Result<std::collections::HashMap<String, ClientProfile>> {
    match std::env::var("XG2G_PROFILES") {
        Ok(raw) if !raw.trim().is_empty() => decision::profiles_from_json(&raw),
        _ => Ok(decision::default_profiles()),
    }
}
