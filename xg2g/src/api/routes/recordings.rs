//! Recording stream-info, playback artifacts, and deletion.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use tracing::info;

use crate::api::models::{StreamInfoRequest, StreamInfoResponse};
use crate::api::problem::Problem;
use crate::api::range::serve_bytes;
use crate::api::request_id::RequestId;
use crate::api::routes::sessions::playlist_response;
use crate::api::server::AppState;
use crate::error::ErrorKind;
use crate::intents::DEFAULT_PROFILE;
use crate::resolver::recording_id;

/// `POST /api/v3/recordings/{id}/stream-info`: server-authoritative playback
/// decision, stamped with a decision token the client must echo on
/// `stream.start`.
pub async fn post_stream_info(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    body: Option<Json<StreamInfoRequest>>,
) -> Response {
    let reference = match recording_id::decode(&id) {
        Ok(reference) => reference,
        Err(e) => return Problem::from_error(&e, &request_id.0).into_response(),
    };
    let profile = body
        .and_then(|Json(b)| b.profile)
        .unwrap_or_else(|| DEFAULT_PROFILE.to_string());

    match state.resolver.stream_info_recording(&reference, &profile).await {
        Ok(info) => (
            StatusCode::OK,
            Json(StreamInfoResponse {
                url: state.resolver.playback_url("", &reference, false),
                mode: info.decision.mode.as_str().to_string(),
                duration_seconds: info.duration_seconds,
                is_seekable: info.is_seekable,
                container: info.media.container,
                video_codec: info.media.video_codec,
                audio_codec: info.media.audio_codec,
                reason: info.decision.reason,
                request_id: request_id.0,
                session_id: None,
                playback_decision_token: info.token,
            }),
        )
            .into_response(),
        Err(e) => Problem::from_error(&e, &request_id.0).into_response(),
    }
}

/// `GET /api/v3/recordings/{id}/playlist.m3u8`.
pub async fn get_playlist(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Response {
    let reference = match recording_id::decode(&id) {
        Ok(reference) => reference,
        Err(e) => return Problem::from_error(&e, &request_id.0).into_response(),
    };
    match state.resolver.resolve_recording_playlist(&reference).await {
        Ok(playlist) => playlist_response(playlist.bytes, playlist.content_type),
        Err(e) => Problem::from_error(&e, &request_id.0).into_response(),
    }
}

/// `GET /api/v3/recordings/{id}/{segment}`: allow-list + confinement, single
/// byte ranges, 416 on multi-range.
pub async fn get_segment(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path((id, segment)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let reference = match recording_id::decode(&id) {
        Ok(reference) => reference,
        Err(e) => return Problem::from_error(&e, &request_id.0).into_response(),
    };
    let resolved = match state
        .resolver
        .resolve_recording_segment(&reference, &segment)
        .await
    {
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

/// `DELETE /api/v3/recordings/{id}`: proxies to the receiver and fails any
/// session playing the recording with `SESSION_GONE/recording_deleted`.
pub async fn delete_recording(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Response {
    let reference = match recording_id::decode(&id) {
        Ok(reference) => reference,
        Err(e) => return Problem::from_error(&e, &request_id.0).into_response(),
    };

    if let Err(e) = state.upstream.delete_recording(&reference).await {
        return Problem::from_error(&e, &request_id.0).into_response();
    }

    if let Err(e) = state.recordings.mark_failed(&reference, "recording_deleted").await {
        return Problem::from_error(&e, &request_id.0).into_response();
    }

    // Sessions still playing this recording are gone, not stopped: the
    // readiness loop must not be retried against a deleted source.
    match state.sessions.list().await {
        Ok(sessions) => {
            for session in sessions
                .iter()
                .filter(|s| !s.is_terminal() && s.intent.target == reference)
            {
                if let Err(e) = state
                    .sessions
                    .fail(&session.id, ErrorKind::SessionGone, "recording_deleted")
                    .await
                {
                    tracing::warn!(session_id = %session.id, error = %e,
                                   "failed to fail session for deleted recording");
                }
            }
        }
        Err(e) => {
            return Problem::from_error(&e, &request_id.0).into_response();
        }
    }

    info!(request_id = %request_id.0, "recording deleted");
    StatusCode::NO_CONTENT.into_response()
}
