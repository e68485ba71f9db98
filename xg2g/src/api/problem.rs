//! RFC 7807 problem responses.
//!
//! The kind-to-status mapping lives here and nowhere else; handlers never
//! pick status codes for errors. Every 503 (and `LEASE_BUSY` 409) carries
//! the canonical `Retry-After`.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::config::RETRY_AFTER_SECS;
use crate::error::{Error, ErrorKind};

/// RFC 7807 body. `requestId` always equals the `X-Request-ID` header.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemBody {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub request_id: String,
}

/// A problem ready to serialize, with its transport hints.
#[derive(Debug, Clone)]
pub struct Problem {
    pub status: StatusCode,
    pub body: ProblemBody,
    pub retry_after: Option<u64>,
}

/// Stable `type` namespace per error kind.
fn kind_mapping(kind: ErrorKind) -> (StatusCode, &'static str, &'static str) {
    match kind {
        ErrorKind::InvalidId => (StatusCode::BAD_REQUEST, "vod/invalid-id", "Invalid identifier"),
        ErrorKind::IdempotentReplay => (
            StatusCode::CONFLICT,
            "intents/idempotent-replay",
            "Idempotency key conflict",
        ),
        ErrorKind::LeaseBusy => (
            StatusCode::CONFLICT,
            "sessions/lease-busy",
            "No tuner available",
        ),
        ErrorKind::Preparing => (
            StatusCode::SERVICE_UNAVAILABLE,
            "sessions/preparing",
            "Not ready yet",
        ),
        ErrorKind::SessionGone => (StatusCode::GONE, "sessions/gone", "Session gone"),
        ErrorKind::UpstreamUnavailable => (
            StatusCode::BAD_GATEWAY,
            "upstream/unavailable",
            "Upstream unavailable",
        ),
        ErrorKind::UpstreamTimeout => (
            StatusCode::GATEWAY_TIMEOUT,
            "upstream/timeout",
            "Upstream timeout",
        ),
        ErrorKind::UpstreamAuth => (
            StatusCode::FORBIDDEN,
            "upstream/auth",
            "Upstream rejected credentials",
        ),
        ErrorKind::VodNotFound => (
            StatusCode::NOT_FOUND,
            "recordings/not-found",
            "Recording not found",
        ),
        ErrorKind::VodPlaybackError => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "vod/playback-error",
            "Playback error",
        ),
        ErrorKind::HwCodecUnavailable => (
            StatusCode::FORBIDDEN,
            "vod/hw-codec-unavailable",
            "Hardware codec unavailable",
        ),
        ErrorKind::PolicyDeniesTranscode => (
            StatusCode::FORBIDDEN,
            "vod/policy-denies-transcode",
            "Policy denies transcode",
        ),
        ErrorKind::PreconditionFailed => (
            StatusCode::PRECONDITION_FAILED,
            "intents/precondition-failed",
            "Precondition failed",
        ),
        ErrorKind::InternalError => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal/error",
            "Internal error",
        ),
    }
}

impl Problem {
    pub fn new(
        status: StatusCode,
        type_: impl Into<String>,
        title: impl Into<String>,
        detail: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        let status_code = status;
        let mut problem = Self {
            status: status_code,
            body: ProblemBody {
                type_: type_.into(),
                title: title.into(),
                status: status_code.as_u16(),
                detail: detail.into(),
                instance: None,
                request_id: request_id.into(),
            },
            retry_after: None,
        };
        if status_code == StatusCode::SERVICE_UNAVAILABLE {
            problem.retry_after = Some(RETRY_AFTER_SECS);
        }
        problem
    }

    /// Build a problem from an engine error.
    pub fn from_error(error: &Error, request_id: &str) -> Self {
        // Entity lookups get their own namespace.
        if let Error::NotFound { entity, id } = error {
            return Self::new(
                StatusCode::NOT_FOUND,
                format!("{entity}/not-found"),
                "Not found",
                format!("{entity} {id:?} not found"),
                request_id,
            );
        }

        let kind = error.kind();
        let (status, type_, title) = kind_mapping(kind);
        let detail = match kind {
            // Infrastructure details stay in the logs.
            ErrorKind::InternalError => {
                tracing::error!(error = %error, "internal error");
                "an internal error occurred".to_string()
            }
            _ => error.to_string(),
        };
        let mut problem = Self::new(status, type_, title, detail, request_id);
        if kind == ErrorKind::LeaseBusy {
            problem.retry_after = Some(RETRY_AFTER_SECS);
        }
        problem
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.body.instance = Some(instance.into());
        self
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        if let Some(secs) = self.retry_after
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}
