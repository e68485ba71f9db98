//! Intent endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};

use crate::api::models::{HeartbeatResponse, IntentResponse};
use crate::api::problem::Problem;
use crate::api::request_id::RequestId;
use crate::api::server::AppState;
use crate::intents::{DispatchOutcome, IntentRequest};

/// `POST /api/v3/intents`.
pub async fn post_intent(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(request): Json<IntentRequest>,
) -> Response {
    match state.dispatcher.dispatch(request).await {
        Ok(DispatchOutcome::Started(session)) => (
            StatusCode::OK,
            Json(IntentResponse {
                session_id: session.id,
                state: session.state.as_str().to_string(),
                request_id: request_id.0,
            }),
        )
            .into_response(),
        Ok(DispatchOutcome::Stopped { .. }) => StatusCode::NO_CONTENT.into_response(),
        Ok(DispatchOutcome::Heartbeat {
            session_id,
            snapshot,
        }) => (
            StatusCode::OK,
            Json(HeartbeatResponse {
                session_id,
                heartbeat_deadline: snapshot.heartbeat_deadline,
                lease_expires_at: snapshot.lease_expires_at,
                heartbeat_interval_seconds: snapshot.heartbeat_interval_seconds,
                request_id: request_id.0,
            }),
        )
            .into_response(),
        Err(e) => Problem::from_error(&e, &request_id.0)
            .with_instance("/api/v3/intents")
            .into_response(),
    }
}
