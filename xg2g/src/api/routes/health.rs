//! Liveness and readiness endpoints.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::api::models::HealthzResponse;
use crate::api::server::AppState;
use crate::config::RETRY_AFTER_SECS;
use crate::health::HealthStatus;

/// Always 200 while the process is alive.
pub async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "alive".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// Strict readiness: degraded still serves (200), total unavailability is
/// 503 with the canonical `Retry-After`.
pub async fn readyz(State(state): State<AppState>) -> Response {
    let health = state.health.check_all().await;
    let body = Json(serde_json::json!({
        "status": health.status.as_str(),
        "components": health.components,
    }));
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => (StatusCode::OK, body).into_response(),
        HealthStatus::Unavailable => {
            let mut response = (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
            if let Ok(value) = HeaderValue::from_str(&RETRY_AFTER_SECS.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}
