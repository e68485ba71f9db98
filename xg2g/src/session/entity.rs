//! Session entities and the session state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Session lifecycle states.
///
/// The observable sequence for any session is
/// `NEW → STARTING → (READY)* → STOPPING → STOPPED` or `… → FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    New,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether the state machine permits `self → to`.
    ///
    /// `FAILED` is reachable from any non-terminal state (unrecoverable
    /// errors); everything else follows the lifecycle graph.
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, SessionState::Failed) => true,
            (Self::New, Self::Starting) => true,
            (Self::Starting, Self::Ready) => true,
            // Stop requests are honored at any pre-terminal point.
            (Self::New | Self::Starting | Self::Ready, Self::Stopping) => true,
            (Self::Stopping, Self::Stopped) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Live,
    Recording,
}

/// Client playback intent, normalized at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayIntent {
    pub kind: IntentKind,
    /// Canonical service reference (live) or decoded recording reference.
    pub target: String,
    /// Server-side client capability profile name.
    pub profile: String,
}

impl PlayIntent {
    pub fn live(service_ref: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            kind: IntentKind::Live,
            target: service_ref.into(),
            profile: profile.into(),
        }
    }

    pub fn recording(reference: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            kind: IntentKind::Recording,
            target: reference.into(),
            profile: profile.into(),
        }
    }
}

/// How the backend decided this session should be played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    NativeHls,
    Hlsjs,
    DirectMp4,
    Transcode,
    Deny,
}

impl PlaybackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NativeHls => "native_hls",
            Self::Hlsjs => "hlsjs",
            Self::DirectMp4 => "direct_mp4",
            Self::Transcode => "transcode",
            Self::Deny => "deny",
        }
    }
}

/// Structured last-error snapshot on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl SessionError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Why a session was stopped (STOPPING/STOPPED only).
pub mod stop_reason {
    pub const CLIENT_STOP: &str = "CLIENT_STOP";
    pub const HEARTBEAT_LOST: &str = "HEARTBEAT_LOST";
    pub const TTL_EXHAUSTED: &str = "TTL_EXHAUSTED";
    pub const PIPELINE_ENDED: &str = "PIPELINE_ENDED";
    pub const SHUTDOWN: &str = "SHUTDOWN";
}

/// A playback session.
///
/// Mutated exclusively by the session manager; everything else observes
/// snapshots or bus events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub intent: PlayIntent,
    pub state: SessionState,
    pub lease_id: Option<String>,
    pub pipeline_id: Option<String>,
    pub playback_url: Option<String>,
    pub playback_mode: Option<PlaybackMode>,
    pub decision_token: Option<String>,
    pub heartbeat_deadline: DateTime<Utc>,
    pub idem_key: Option<String>,
    /// SHA-256 fingerprint of the normalized intent payload, stored with the
    /// idempotency key so replays can be verified byte-for-byte.
    pub payload_fingerprint: Option<String>,
    pub last_error: Option<SessionError>,
    pub stop_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub transitioned_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        intent: PlayIntent,
        heartbeat_deadline: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            intent,
            state: SessionState::New,
            lease_id: None,
            pipeline_id: None,
            playback_url: None,
            playback_mode: None,
            decision_token: None,
            heartbeat_deadline,
            idem_key: None,
            payload_fingerprint: None,
            last_error: None,
            stop_reason: None,
            created_at: now,
            transitioned_at: now,
        }
    }

    /// Apply a state transition, enforcing the lifecycle graph and the
    /// terminal-state handle invariants.
    pub fn transition(&mut self, to: SessionState) -> crate::Result<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition_to(to) {
            return Err(crate::Error::invalid_transition(
                self.state.as_str(),
                to.as_str(),
            ));
        }
        self.state = to;
        self.transitioned_at = Utc::now();
        if to.is_terminal() {
            self.lease_id = None;
            self.pipeline_id = None;
        }
        Ok(())
    }

    /// Mark the session failed with a structured cause.
    pub fn fail(&mut self, kind: ErrorKind, detail: impl Into<String>) -> crate::Result<()> {
        self.last_error = Some(SessionError::new(kind, detail));
        self.transition(SessionState::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// READY invariant: playback URL, lease, and decision token all present.
    pub fn ready_invariant_holds(&self) -> bool {
        self.state != SessionState::Ready
            || (self.playback_url.is_some()
                && self.lease_id.is_some()
                && self.decision_token.is_some())
    }
}
