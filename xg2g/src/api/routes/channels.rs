//! Live channel stream-info.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};

use crate::api::models::{StreamInfoRequest, StreamInfoResponse};
use crate::api::problem::Problem;
use crate::api::request_id::RequestId;
use crate::api::server::AppState;
use crate::intents::{DEFAULT_PROFILE, normalize_service_ref};

/// `POST /api/v3/channels/{service_ref}/stream-info`: playback decision for a
/// live service. The token from here feeds the `stream.start` intent.
pub async fn post_stream_info(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(service_ref): Path<String>,
    body: Option<Json<StreamInfoRequest>>,
) -> Response {
    let reference = match normalize_service_ref(&service_ref) {
        Ok(reference) => reference,
        Err(e) => return Problem::from_error(&e, &request_id.0).into_response(),
    };
    let profile = body
        .and_then(|Json(b)| b.profile)
        .unwrap_or_else(|| DEFAULT_PROFILE.to_string());

    match state.resolver.stream_info_live(&reference, &profile) {
        Ok(info) => (
            StatusCode::OK,
            Json(StreamInfoResponse {
                // The playable URL exists once a session is READY; live
                // clients always go through the intent flow.
                url: String::new(),
                mode: info.decision.mode.as_str().to_string(),
                duration_seconds: None,
                is_seekable: false,
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
