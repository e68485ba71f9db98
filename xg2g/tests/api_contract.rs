//! End-to-end contract tests for the v3 HTTP adapter.
//!
//! The full component graph is wired with the in-memory store, a mock
//! upstream, and a shell-script pipeline backend, then driven through the
//! axum router one request at a time.

#![cfg(unix)]

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use tower::util::ServiceExt;

use xg2g::config::{ApiTokens, AppConfig};
use xg2g::error::Result;
use xg2g::pipeline::{PipelineBackend, PipelineSpec};
use xg2g::resolver::decision::MediaInfo;
use xg2g::resolver::duration::{MediaProber, ProbeSource};
use xg2g::resolver::recording_id;
use xg2g::services::ServiceContainer;
use xg2g::store::memory::MemoryStore;
use xg2g::upstream::MockUpstream;

const READ_TOKEN: &str = "token-read";
const WRITE_TOKEN: &str = "token-write";
const ADMIN_TOKEN: &str = "token-admin";

/// Pipeline backend that runs a shell script; `$OUT` is the session dir.
struct ScriptBackend {
    script: String,
}

impl PipelineBackend for ScriptBackend {
    fn name(&self) -> &'static str {
        "script"
    }

    fn spawn(&self, spec: &PipelineSpec) -> Result<tokio::process::Child> {
        process_utils::tokio_command("sh")
            .arg("-c")
            .arg(&self.script)
            .env("OUT", &spec.output_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| xg2g::Error::Pipeline(e.to_string()))
    }
}

struct StaticProber;

#[async_trait]
impl MediaProber for StaticProber {
    async fn probe(&self, _source: &ProbeSource) -> Result<MediaInfo> {
        Ok(MediaInfo {
            container: "mpegts".into(),
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
            duration_seconds: Some(3600.0),
        })
    }
}

/// Script that waits briefly, then produces a playlist with one 4096-byte
/// segment, then keeps running like a live pipeline.
const LIVE_SCRIPT: &str = r#"
sleep 1
head -c 4096 /dev/zero > "$OUT/seg_00000.ts"
printf '#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg_00000.ts\n' > "$OUT/index.m3u8"
sleep 60
"#;

/// Script that produces artifacts quickly and exits cleanly (VOD remux).
const VOD_SCRIPT: &str = r#"
head -c 4096 /dev/zero > "$OUT/seg_00000.ts"
printf '#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg_00000.ts\n' > "$OUT/index.m3u8"
sleep 0.3
exit 0
"#;

struct TestApp {
    router: Router,
    upstream: Arc<MockUpstream>,
    _container: ServiceContainer,
    _hls: tempfile::TempDir,
    recordings_dir: tempfile::TempDir,
}

async fn test_app(script: &str, tuner_slots: usize) -> TestApp {
    let hls = tempfile::tempdir().unwrap();
    let recordings_dir = tempfile::tempdir().unwrap();

    let mut config = AppConfig::default();
    config.hls_root = hls.path().to_path_buf();
    config.recordings_dir = recordings_dir.path().to_path_buf();
    config.tuner_slots = tuner_slots;
    config.stop_grace = Duration::from_millis(300);
    config.token_secret = "contract-test-secret".to_string();
    config.api_tokens = ApiTokens {
        read: Some(READ_TOKEN.to_string()),
        write: Some(WRITE_TOKEN.to_string()),
        admin: Some(ADMIN_TOKEN.to_string()),
    };

    let upstream = Arc::new(MockUpstream::new());
    let container = ServiceContainer::wire(
        config,
        Arc::new(MemoryStore::new()),
        upstream.clone(),
        Arc::new(ScriptBackend {
            script: script.to_string(),
        }),
        Arc::new(StaticProber),
    )
    .unwrap();
    container.initialize().await.unwrap();

    TestApp {
        router: xg2g::api::routes::create_router(container.app_state()),
        upstream,
        _container: container,
        _hls: hls,
        recordings_dir,
    }
}

impl TestApp {
    async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str, token: &str) -> Response<Body> {
        self.request(
            Request::builder()
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    async fn post_json(&self, uri: &str, token: &str, body: serde_json::Value) -> Response<Body> {
        self.request(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn live_decision_token(&self, service_ref: &str) -> String {
        let response = self
            .request(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/v3/channels/{service_ref}/stream-info"))
                    .header(header::AUTHORIZATION, format!("Bearer {WRITE_TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        json_body(response).await["playbackDecisionToken"]
            .as_str()
            .unwrap()
            .to_string()
    }

    async fn start_live(&self, service_ref: &str, idem_key: Option<&str>) -> Response<Body> {
        let token = self.live_decision_token(service_ref).await;
        let mut body = serde_json::json!({
            "type": "stream.start",
            "serviceRef": service_ref,
            "decisionToken": token,
        });
        if let Some(key) = idem_key {
            body["idemKey"] = serde_json::Value::String(key.to_string());
        }
        self.post_json("/api/v3/intents", WRITE_TOKEN, body).await
    }

    async fn poll_until_ready(&self, session_id: &str) -> serde_json::Value {
        for _ in 0..100 {
            let response = self
                .get(&format!("/api/v3/sessions/{session_id}"), READ_TOKEN)
                .await;
            if response.status() == StatusCode::OK {
                return json_body(response).await;
            }
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("session {session_id} never became ready");
    }
}

async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn live_start_happy_path() {
    let app = test_app(LIVE_SCRIPT, 2).await;

    let response = app.start_live("1:0:1:ABCD", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let session_id = body["sessionId"].as_str().unwrap().to_string();

    // The first poll happens inside the startup window: 503 + Retry-After.
    let response = app
        .get(&format!("/api/v3/sessions/{session_id}"), READ_TOKEN)
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "10");
    let body = json_body(response).await;
    assert_eq!(body["reason"], "PREPARING");

    // Within the startup budget the session becomes READY.
    let status = app.poll_until_ready(&session_id).await;
    assert_eq!(status["state"], "READY");
    assert_eq!(status["mode"], "native_hls");
    let playback_url = status["playbackUrl"].as_str().unwrap().to_string();
    assert_eq!(
        playback_url,
        format!("/api/v3/sessions/{session_id}/hls/index.m3u8")
    );

    // The playlist is served with the HLS content type.
    let response = app.get(&playback_url, READ_TOKEN).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/vnd.apple.mpegurl"
    );

    // Heartbeat advances the lease.
    let response = app
        .post_json(
            &format!("/api/v3/sessions/{session_id}/heartbeat"),
            WRITE_TOKEN,
            serde_json::json!({}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["leaseExpiresAt"].is_string());

    // Stop is idempotent: 204 both times.
    for _ in 0..2 {
        let response = app
            .post_json(
                "/api/v3/intents",
                WRITE_TOKEN,
                serde_json::json!({
                    "type": "stream.stop",
                    "sessionId": session_id,
                }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let response = app
        .get(&format!("/api/v3/sessions/{session_id}"), READ_TOKEN)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["state"], "STOPPED");
}

#[tokio::test]
async fn idempotent_replay_returns_the_same_session() {
    let app = test_app(LIVE_SCRIPT, 2).await;

    let first = json_body(app.start_live("1:0:1:ABCD", Some("k-1")).await).await;
    let second = json_body(app.start_live("1:0:1:ABCD", Some("k-1")).await).await;
    assert_eq!(first["sessionId"], second["sessionId"]);

    // Same key, different payload: 409 IDEMPOTENT_REPLAY.
    let response = app.start_live("1:0:1:BEEF", Some("k-1")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert_eq!(body["type"], "intents/idempotent-replay");
}

#[tokio::test]
async fn lease_exhaustion_is_409_with_retry_after() {
    let app = test_app(LIVE_SCRIPT, 1).await;

    let response = app.start_live("1:0:1:ABCD", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.start_live("1:0:1:BEEF", None).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "10");
    let body = json_body(response).await;
    assert_eq!(body["type"], "sessions/lease-busy");
}

#[tokio::test]
async fn deleted_recording_makes_the_session_gone() {
    let app = test_app(VOD_SCRIPT, 2).await;
    std::fs::write(app.recordings_dir.path().join("show.ts"), vec![1u8; 8192]).unwrap();
    let recording_id = recording_id::encode("show.ts");

    // Decision token from stream-info.
    let response = app
        .post_json(
            &format!("/api/v3/recordings/{recording_id}/stream-info"),
            WRITE_TOKEN,
            serde_json::json!({"profile": "native_hls"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let info = json_body(response).await;
    assert_eq!(info["isSeekable"], true);
    assert_eq!(info["durationSeconds"], 3600.0);
    let token = info["playbackDecisionToken"].as_str().unwrap().to_string();

    let response = app
        .post_json(
            "/api/v3/intents",
            WRITE_TOKEN,
            serde_json::json!({
                "type": "stream.start",
                "recordingId": recording_id,
                "decisionToken": token,
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = json_body(response).await["sessionId"]
        .as_str()
        .unwrap()
        .to_string();
    app.poll_until_ready(&session_id).await;

    // The recording playlist is VOD-rewritten once finalized.
    let response = app
        .get(
            &format!("/api/v3/recordings/{recording_id}/playlist.m3u8"),
            READ_TOKEN,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
    assert!(text.contains("#EXT-X-ENDLIST"));

    // Delete upstream; the session is gone, not retryable.
    let response = app
        .request(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v3/recordings/{recording_id}"))
                .header(header::AUTHORIZATION, format!("Bearer {WRITE_TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(app.upstream.deleted(), vec!["show.ts".to_string()]);

    let response = app
        .get(&format!("/api/v3/sessions/{session_id}"), READ_TOKEN)
        .await;
    assert_eq!(response.status(), StatusCode::GONE);
    let body = json_body(response).await;
    assert_eq!(body["reason"], "SESSION_GONE");
    assert_eq!(body["reasonDetail"], "recording_deleted");
}

#[tokio::test]
async fn segment_range_requests() {
    let app = test_app(VOD_SCRIPT, 2).await;
    std::fs::write(app.recordings_dir.path().join("show.ts"), vec![1u8; 8192]).unwrap();
    let recording_id = recording_id::encode("show.ts");

    let info = json_body(
        app.post_json(
            &format!("/api/v3/recordings/{recording_id}/stream-info"),
            WRITE_TOKEN,
            serde_json::json!({}),
        )
        .await,
    )
    .await;
    let token = info["playbackDecisionToken"].as_str().unwrap().to_string();
    let response = app
        .post_json(
            "/api/v3/intents",
            WRITE_TOKEN,
            serde_json::json!({
                "type": "stream.start",
                "recordingId": recording_id,
                "decisionToken": token,
            }),
        )
        .await;
    let session_id = json_body(response).await["sessionId"]
        .as_str()
        .unwrap()
        .to_string();
    app.poll_until_ready(&session_id).await;

    let uri = format!("/api/v3/recordings/{recording_id}/seg_00000.ts");
    let ranged = |range: &'static str| {
        Request::builder()
            .uri(&uri)
            .header(header::AUTHORIZATION, format!("Bearer {READ_TOKEN}"))
            .header(header::RANGE, range)
            .body(Body::empty())
            .unwrap()
    };

    // bytes=0-0 → one byte.
    let response = app.request(ranged("bytes=0-0")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes 0-0/4096"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(bytes.len(), 1);

    // Suffix range → last 100 bytes.
    let response = app.request(ranged("bytes=-100")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes 3996-4095/4096"
    );

    // Start past the end → 416 with the star form.
    let response = app.request(ranged("bytes=5000-")).await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        response.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes */4096"
    );

    // Multi-range → 416.
    let response = app.request(ranged("bytes=0-0,1-1")).await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn path_traversal_is_rejected() {
    let app = test_app(VOD_SCRIPT, 2).await;
    let recording_id = recording_id::encode("show.ts");

    let response = app
        .get(
            &format!("/api/v3/recordings/{recording_id}/..%2Fetc%2Fpasswd"),
            READ_TOKEN,
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["type"], "vod/invalid-id");

    // A recording id that decodes to traversal is refused outright.
    let bad_id = recording_id::encode("../../etc/passwd");
    let response = app
        .get(
            &format!("/api/v3/recordings/{bad_id}/playlist.m3u8"),
            READ_TOKEN,
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn request_id_is_echoed_in_header_and_body() {
    let app = test_app(LIVE_SCRIPT, 2).await;

    let response = app
        .request(
            Request::builder()
                .uri("/api/v3/sessions/does-not-exist")
                .header(header::AUTHORIZATION, format!("Bearer {READ_TOKEN}"))
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-42");
    let body = json_body(response).await;
    assert_eq!(body["requestId"], "req-42");
}

#[tokio::test]
async fn auth_fails_closed() {
    let app = test_app(LIVE_SCRIPT, 2).await;

    // No token.
    let response = app
        .request(
            Request::builder()
                .uri("/api/v3/sessions/s-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Read token cannot write.
    let response = app
        .post_json(
            "/api/v3/intents",
            READ_TOKEN,
            serde_json::json!({"type": "stream.stop", "sessionId": "s-1"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Write token cannot administrate.
    let response = app
        .post_json("/api/v3/admin/leases/drop", WRITE_TOKEN, serde_json::json!({}))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Admin token can do everything.
    let response = app
        .post_json("/api/v3/admin/leases/drop", ADMIN_TOKEN, serde_json::json!({}))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn health_endpoints() {
    let app = test_app(LIVE_SCRIPT, 2).await;

    let response = app
        .request(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "alive");

    let response = app
        .request(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");

    // A dark upstream degrades but keeps serving.
    app.upstream.set_reachable(false);
    let response = app
        .request(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "degraded");
}

#[tokio::test]
async fn stream_start_without_token_is_precondition_failed() {
    let app = test_app(LIVE_SCRIPT, 2).await;

    let response = app
        .post_json(
            "/api/v3/intents",
            WRITE_TOKEN,
            serde_json::json!({
                "type": "stream.start",
                "serviceRef": "1:0:1:ABCD",
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

    // A token minted for another target is refused too.
    let token = app.live_decision_token("1:0:1:ABCD").await;
    let response = app
        .post_json(
            "/api/v3/intents",
            WRITE_TOKEN,
            serde_json::json!({
                "type": "stream.start",
                "serviceRef": "1:0:1:BEEF",
                "decisionToken": token,
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn malformed_intents_are_invalid() {
    let app = test_app(LIVE_SCRIPT, 2).await;

    for body in [
        serde_json::json!({"type": "stream.dance"}),
        serde_json::json!({"type": "stream.start"}),
        serde_json::json!({"type": "stream.start", "serviceRef": "not a ref", "decisionToken": "x"}),
        serde_json::json!({"type": "stream.stop"}),
    ] {
        let response = app.post_json("/api/v3/intents", WRITE_TOKEN, body.clone()).await;
        assert_eq!(
            response.status(),
            StatusCode::BAD_REQUEST,
            "expected 400 for {body}"
        );
    }
}
