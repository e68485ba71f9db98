//! Application-wide error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error taxonomy shared by the engine and the wire contract.
///
/// Every failure the engine reports to a client maps to exactly one of these
/// kinds; the HTTP adapter owns the kind-to-status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidId,
    IdempotentReplay,
    LeaseBusy,
    Preparing,
    SessionGone,
    UpstreamUnavailable,
    UpstreamTimeout,
    UpstreamAuth,
    VodNotFound,
    VodPlaybackError,
    HwCodecUnavailable,
    PolicyDeniesTranscode,
    PreconditionFailed,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidId => "INVALID_ID",
            Self::IdempotentReplay => "IDEMPOTENT_REPLAY",
            Self::LeaseBusy => "LEASE_BUSY",
            Self::Preparing => "PREPARING",
            Self::SessionGone => "SESSION_GONE",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            Self::UpstreamAuth => "UPSTREAM_AUTH",
            Self::VodNotFound => "VOD_NOT_FOUND",
            Self::VodPlaybackError => "VOD_PLAYBACK_ERROR",
            Self::HwCodecUnavailable => "HW_CODEC_UNAVAILABLE",
            Self::PolicyDeniesTranscode => "POLICY_DENIES_TRANSCODE",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind}: {detail}")]
    Engine { kind: ErrorKind, detail: String },

    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

impl Error {
    pub fn engine(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::Engine {
            kind,
            detail: detail.into(),
        }
    }

    pub fn invalid_id(detail: impl Into<String>) -> Self {
        Self::engine(ErrorKind::InvalidId, detail)
    }

    pub fn lease_busy(detail: impl Into<String>) -> Self {
        Self::engine(ErrorKind::LeaseBusy, detail)
    }

    pub fn session_gone(detail: impl Into<String>) -> Self {
        Self::engine(ErrorKind::SessionGone, detail)
    }

    pub fn precondition(detail: impl Into<String>) -> Self {
        Self::engine(ErrorKind::PreconditionFailed, detail)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Taxonomy kind of this error. Infrastructure failures collapse to
    /// `INTERNAL_ERROR`; the detailed cause stays in the `Display` output.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Engine { kind, .. } => *kind,
            Self::InvalidStateTransition { .. } => ErrorKind::PreconditionFailed,
            Self::NotFound { .. } => ErrorKind::VodNotFound,
            Self::DatabaseSqlx(_)
            | Self::Serialization(_)
            | Self::Io(_)
            | Self::Configuration(_)
            | Self::Pipeline(_) => ErrorKind::InternalError,
        }
    }
}
