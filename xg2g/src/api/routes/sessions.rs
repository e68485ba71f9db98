//! Session status, heartbeat, and per-session HLS artifacts.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};

use crate::api::models::{HeartbeatResponse, SessionStatusResponse};
use crate::api::problem::Problem;
use crate::api::range::serve_bytes;
use crate::api::request_id::RequestId;
use crate::api::server::AppState;
use crate::config::RETRY_AFTER_SECS;
use crate::error::ErrorKind;
use crate::resolver::PLAYLIST_NAME;
use crate::session::entity::SessionState;

/// `GET /api/v3/sessions/{id}`: the readiness loop.
///
/// NEW/STARTING → 503 + `Retry-After: 10`; READY → 200 with the playback
/// URL; FAILED with `SESSION_GONE` → 410. Clients never infer readiness.
pub async fn get_session(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Response {
    let session = match state.sessions.get(&id).await {
        Ok(session) => session,
        Err(e) => return Problem::from_error(&e, &request_id.0).into_response(),
    };

    let mut dto = SessionStatusResponse::from_session(
        &session,
        state.sessions.heartbeat_interval_seconds(),
        &request_id.0,
    );

    match session.state {
        SessionState::New | SessionState::Starting => {
            dto.reason = Some("PREPARING".to_string());
            let mut response =
                (StatusCode::SERVICE_UNAVAILABLE, Json(dto)).into_response();
            if let Ok(value) = HeaderValue::from_str(&RETRY_AFTER_SECS.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
        SessionState::Ready | SessionState::Stopping | SessionState::Stopped => {
            (StatusCode::OK, Json(dto)).into_response()
        }
        SessionState::Failed => {
            let kind = session
                .last_error
                .as_ref()
                .map(|e| e.kind)
                .unwrap_or(ErrorKind::InternalError);
            if kind == ErrorKind::SessionGone {
                (StatusCode::GONE, Json(dto)).into_response()
            } else {
                let detail = session
                    .last_error
                    .as_ref()
                    .map(|e| e.detail.clone())
                    .unwrap_or_else(|| "session failed".to_string());
                Problem::from_error(
                    &crate::error::Error::engine(kind, detail),
                    &request_id.0,
                )
                .into_response()
            }
        }
    }
}

/// `POST /api/v3/sessions/{id}/heartbeat`: advances deadline, renews lease.
/// 410 when the session is terminal.
pub async fn post_heartbeat(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Response {
    match state.sessions.heartbeat(&id).await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(HeartbeatResponse {
                session_id: id,
                heartbeat_deadline: snapshot.heartbeat_deadline,
                lease_expires_at: snapshot.lease_expires_at,
                heartbeat_interval_seconds: snapshot.heartbeat_interval_seconds,
                request_id: request_id.0,
            }),
        )
            .into_response(),
        Err(e) => Problem::from_error(&e, &request_id.0).into_response(),
    }
}

/// `GET /api/v3/sessions/{id}/hls/{artifact}`: session playlist and segments.
///
/// The playlist is gated on at least one allow-listed segment existing in
/// the session's confined directory; segments themselves pass the allow-list
/// and confinement checks and support single byte ranges.
pub async fn get_artifact(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path((id, artifact)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    // Artifacts are only served for sessions that reached READY.
    let session = match state.sessions.get(&id).await {
        Ok(session) => session,
        Err(e) => return Problem::from_error(&e, &request_id.0).into_response(),
    };
    if session.state != SessionState::Ready {
        let error = if session.is_terminal() {
            crate::error::Error::session_gone("session no longer serves media")
        } else {
            crate::error::Error::engine(ErrorKind::Preparing, "session not ready")
        };
        return Problem::from_error(&error, &request_id.0).into_response();
    }

    if artifact == PLAYLIST_NAME {
        return match state.resolver.resolve_session_playlist(&id) {
            Ok(playlist) => playlist_response(playlist.bytes, playlist.content_type),
            Err(e) => Problem::from_error(&e, &request_id.0).into_response(),
        };
    }

    let resolved = match state.resolver.resolve_session_segment(&id, &artifact) {
        Ok(resolved) => resolved,
        Err(e) => return Problem::from_error(&e, &request_id.0).into_response(),
    };
    let bytes = match tokio::fs::read(&resolved.path).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Problem::from_error(
                &crate::error::Error::engine(ErrorKind::VodNotFound, "segment vanished"),
                &request_id.0,
            )
            .into_response();
        }
    };
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    serve_bytes(bytes, resolved.kind.content_type(), range)
}

pub(super) fn playlist_response(bytes: Vec<u8>, content_type: &'static str) -> Response {
    let mut response = (StatusCode::OK, bytes).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
