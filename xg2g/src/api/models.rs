//! Wire DTOs for the v3 API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::entity::Session;

/// `GET /api/v3/sessions/{id}` body; also used for 503/410 responses so the
/// readiness loop sees one shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    pub heartbeat_interval_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_detail: Option<String>,
    pub request_id: String,
}

impl SessionStatusResponse {
    pub fn from_session(
        session: &Session,
        heartbeat_interval_seconds: u64,
        request_id: &str,
    ) -> Self {
        let (reason, reason_detail) = match (&session.last_error, &session.stop_reason) {
            (Some(error), _) => (
                Some(error.kind.as_str().to_string()),
                Some(error.detail.clone()),
            ),
            (None, Some(stop)) => (Some(stop.clone()), None),
            (None, None) => (None, None),
        };
        Self {
            state: session.state.as_str().to_string(),
            playback_url: session.playback_url.clone(),
            mode: session.playback_mode.map(|m| m.as_str().to_string()),
            heartbeat_interval_seconds,
            reason,
            reason_detail,
            request_id: request_id.to_string(),
        }
    }
}

/// `POST /api/v3/intents` response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResponse {
    pub session_id: String,
    pub state: String,
    pub request_id: String,
}

/// Heartbeat response: the advanced deadlines.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub session_id: String,
    pub heartbeat_deadline: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub heartbeat_interval_seconds: u64,
    pub request_id: String,
}

/// `POST .../stream-info` request body. Strict: unknown fields rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StreamInfoRequest {
    pub profile: Option<String>,
}

/// Playback decision DTO.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfoResponse {
    pub url: String,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub is_seekable: bool,
    pub container: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub reason: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub playback_decision_token: String,
}

/// `GET /healthz` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthzResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Admin session listing entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub state: String,
    pub kind: String,
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub heartbeat_deadline: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
}

impl SessionSummary {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            state: session.state.as_str().to_string(),
            kind: match session.intent.kind {
                crate::session::entity::IntentKind::Live => "live".to_string(),
                crate::session::entity::IntentKind::Recording => "recording".to_string(),
            },
            target: session.intent.target.clone(),
            created_at: session.created_at,
            heartbeat_deadline: session.heartbeat_deadline,
            lease_id: session.lease_id.clone(),
            pipeline_id: session.pipeline_id.clone(),
        }
    }
}
