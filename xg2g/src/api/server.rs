//! API server setup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::auth::AuthConfig;
use crate::api::routes;
use crate::error::{Error, Result};
use crate::health::HealthChecker;
use crate::intents::IntentDispatcher;
use crate::lease::LeaseArbiter;
use crate::recording::RecordingService;
use crate::resolver::ArtifactResolver;
use crate::session::manager::SessionManager;
use crate::upstream::UpstreamClient;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8088,
            enable_cors: true,
        }
    }
}

/// Shared application state for handlers.
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub dispatcher: Arc<IntentDispatcher>,
    pub sessions: SessionManager,
    pub resolver: Arc<ArtifactResolver>,
    pub recordings: Arc<RecordingService>,
    pub arbiter: Arc<LeaseArbiter>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub health: Arc<HealthChecker>,
    pub auth: AuthConfig,
}

impl axum::extract::FromRef<AppState> for AuthConfig {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            state,
            cancel_token,
        }
    }

    fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone());
        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }
        // Health probes fire every few seconds; keep them out of the spans.
        router.layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::extract::Request| {
                let path = request.uri().path();
                if path == "/healthz" || path == "/readyz" {
                    tracing::Span::none()
                } else {
                    let mut make_span = tower_http::trace::DefaultMakeSpan::new()
                        .level(tracing::Level::INFO);
                    use tower_http::trace::MakeSpan;
                    make_span.make_span(request)
                }
            },
        ))
    }

    /// Serve until the cancellation token fires.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid bind address: {e}")))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("API server listening on http://{addr}");

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down");
            })
            .await
            .map_err(|e| Error::config(format!("server error: {e}")))?;
        Ok(())
    }
}
