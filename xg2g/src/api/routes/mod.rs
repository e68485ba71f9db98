//! API route modules.

pub mod admin;
pub mod channels;
pub mod health;
pub mod intents;
pub mod recordings;
pub mod sessions;

use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post};

use crate::api::auth::{require_admin, require_read, require_write};
use crate::api::request_id::request_id_middleware;
use crate::api::server::AppState;

/// Build the v3 router.
///
/// - Public: `/healthz`, `/readyz`.
/// - Read scope: session status and artifact fetches.
/// - Write scope: intents, heartbeats, stream-info, recording deletion.
/// - Admin scope: session listing and lease reset.
pub fn create_router(state: AppState) -> Router {
    let auth = state.auth.clone();

    let read_routes: Router<AppState> = Router::new()
        .route("/api/v3/sessions/{id}", get(sessions::get_session))
        .route(
            "/api/v3/sessions/{id}/hls/{artifact}",
            get(sessions::get_artifact),
        )
        .route(
            "/api/v3/recordings/{id}/playlist.m3u8",
            get(recordings::get_playlist),
        )
        .route(
            "/api/v3/recordings/{id}/{segment}",
            get(recordings::get_segment),
        )
        .route_layer(from_fn_with_state(auth.clone(), require_read));

    let write_routes: Router<AppState> = Router::new()
        .route("/api/v3/intents", post(intents::post_intent))
        .route(
            "/api/v3/sessions/{id}/heartbeat",
            post(sessions::post_heartbeat),
        )
        .route(
            "/api/v3/recordings/{id}/stream-info",
            post(recordings::post_stream_info),
        )
        .route(
            "/api/v3/channels/{service_ref}/stream-info",
            post(channels::post_stream_info),
        )
        .route(
            "/api/v3/recordings/{id}",
            delete(recordings::delete_recording),
        )
        .route_layer(from_fn_with_state(auth.clone(), require_write));

    let admin_routes: Router<AppState> = Router::new()
        .route("/api/v3/sessions", get(admin::list_sessions))
        .route("/api/v3/admin/leases/drop", post(admin::drop_leases))
        .route_layer(from_fn_with_state(auth, require_admin));

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .merge(read_routes)
        .merge(write_routes)
        .merge(admin_routes)
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}
