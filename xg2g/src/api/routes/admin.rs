//! Administrative endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};

use crate::api::models::SessionSummary;
use crate::api::problem::Problem;
use crate::api::request_id::RequestId;
use crate::api::server::AppState;

/// `GET /api/v3/sessions`: diagnostic listing of every persisted session.
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> Response {
    match state.sessions.list().await {
        Ok(sessions) => {
            let summaries: Vec<SessionSummary> =
                sessions.iter().map(SessionSummary::from_session).collect();
            (StatusCode::OK, Json(summaries)).into_response()
        }
        Err(e) => Problem::from_error(&e, &request_id.0).into_response(),
    }
}

/// `POST /api/v3/admin/leases/drop`: operator reset of the tuner table.
pub async fn drop_leases(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> Response {
    match state.arbiter.drop_all().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => Problem::from_error(&e, &request_id.0).into_response(),
    }
}
