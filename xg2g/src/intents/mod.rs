//! Intent dispatch.
//!
//! Accepts client intents, validates and normalizes their payloads, applies
//! idempotency, and routes to the session manager. Never blocks on pipeline
//! readiness; callers discover readiness by polling the session.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::resolver::recording_id;
use crate::session::entity::{PlayIntent, Session};
use crate::session::entity::stop_reason;
use crate::session::manager::{HeartbeatSnapshot, SessionManager};

/// Default client profile when an intent names none.
pub const DEFAULT_PROFILE: &str = "native_hls";

/// Wire intent payload. Strict: unknown fields are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct IntentRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub service_ref: Option<String>,
    pub recording_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub params: Option<IntentParams>,
    pub idem_key: Option<String>,
    pub decision_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct IntentParams {
    pub profile: Option<String>,
}

/// What an accepted intent did.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Started(Session),
    Stopped { session_id: String },
    Heartbeat {
        session_id: String,
        snapshot: HeartbeatSnapshot,
    },
}

/// Validates intents and routes them to the session manager.
pub struct IntentDispatcher {
    sessions: SessionManager,
}

impl IntentDispatcher {
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn dispatch(&self, request: IntentRequest) -> Result<DispatchOutcome> {
        match request.kind.as_str() {
            "stream.start" => self.start(request).await,
            "stream.stop" => {
                let session_id = require_session_id(&request)?;
                self.sessions.stop(&session_id, stop_reason::CLIENT_STOP).await?;
                Ok(DispatchOutcome::Stopped { session_id })
            }
            "stream.heartbeat" => {
                let session_id = require_session_id(&request)?;
                let snapshot = self.sessions.heartbeat(&session_id).await?;
                Ok(DispatchOutcome::Heartbeat {
                    session_id,
                    snapshot,
                })
            }
            other => Err(Error::invalid_id(format!("unknown intent type {other:?}"))),
        }
    }

    async fn start(&self, request: IntentRequest) -> Result<DispatchOutcome> {
        let profile = request
            .params
            .as_ref()
            .and_then(|p| p.profile.clone())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());

        let intent = match (&request.service_ref, &request.recording_id) {
            (Some(_), Some(_)) => {
                return Err(Error::invalid_id(
                    "intent must name either serviceRef or recordingId, not both",
                ));
            }
            (Some(service_ref), None) => {
                PlayIntent::live(normalize_service_ref(service_ref)?, profile)
            }
            (None, Some(id)) => PlayIntent::recording(recording_id::decode(id)?, profile),
            (None, None) => {
                return Err(Error::invalid_id(
                    "stream.start requires serviceRef or recordingId",
                ));
            }
        };

        let idem_key = match request.idem_key.as_deref() {
            Some(key) => Some(validate_idem_key(key)?),
            None => None,
        };
        let token = request.decision_token.as_deref().unwrap_or_default();

        let session = self.sessions.create(intent, idem_key, token).await?;
        Ok(DispatchOutcome::Started(session))
    }
}

fn require_session_id(request: &IntentRequest) -> Result<String> {
    request
        .session_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::invalid_id("intent requires sessionId"))
}

/// Canonicalize an Enigma2 service reference.
///
/// References are colon-separated hex fields (`1:0:1:ABCD:…`); anything else
/// is rejected at the boundary rather than passed through opaquely.
pub fn normalize_service_ref(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > 256 {
        return Err(Error::invalid_id("service reference length out of range"));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_hexdigit() || c == ':')
    {
        return Err(Error::invalid_id(
            "service reference contains invalid characters",
        ));
    }
    if !trimmed.contains(':') {
        return Err(Error::invalid_id("service reference has no fields"));
    }
    Ok(trimmed.to_string())
}

fn validate_idem_key(key: &str) -> Result<String> {
    if key.is_empty() || key.len() > 128 {
        return Err(Error::invalid_id("idempotency key length out of range"));
    }
    if !key.chars().all(|c| c.is_ascii_graphic()) {
        return Err(Error::invalid_id("idempotency key must be printable ASCII"));
    }
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_ref_normalization() {
        assert_eq!(normalize_service_ref(" 1:0:1:ABCD ").unwrap(), "1:0:1:ABCD");
        assert_eq!(
            normalize_service_ref("1:0:1:ABCD:1:1:C00000:0:0:0:").unwrap(),
            "1:0:1:ABCD:1:1:C00000:0:0:0:"
        );
        for bad in ["", "not a ref", "1:0:1:XYZP", "../x", "ABCD"] {
            assert!(normalize_service_ref(bad).is_err(), "should reject {bad:?}");
        }
    }

    #[test]
    fn idem_key_validation() {
        assert!(validate_idem_key("k-1").is_ok());
        assert!(validate_idem_key("").is_err());
        assert!(validate_idem_key("has space").is_err());
        assert!(validate_idem_key(&"x".repeat(200)).is_err());
    }

    #[test]
    fn intent_request_rejects_unknown_fields() {
        let raw = r#"{"type":"stream.start","serviceRef":"1:0:1:A","bogus":true}"#;
        assert!(serde_json::from_str::<IntentRequest>(raw).is_err());
    }

    #[test]
    fn intent_request_parses_wire_shape() {
        let raw = r#"{
            "type": "stream.start",
            "serviceRef": "1:0:1:ABCD",
            "params": {"profile": "web"},
            "idemKey": "k-1",
            "decisionToken": "tok"
        }"#;
        let request: IntentRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.kind, "stream.start");
        assert_eq!(request.service_ref.as_deref(), Some("1:0:1:ABCD"));
        assert_eq!(
            request.params.unwrap().profile.as_deref(),
            Some("web")
        );
        assert_eq!(request.idem_key.as_deref(), Some("k-1"));
    }
}
