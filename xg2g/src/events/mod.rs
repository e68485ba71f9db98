//! In-process event bus.
//!
//! Per-topic broadcast channels give strict ordering within a topic;
//! cross-topic ordering is not guaranteed. Durable state transitions reach
//! the bus through the outbox relay ([`outbox::OutboxRelay`]), which makes
//! delivery at-least-once, so subscribers must tolerate duplicates.

pub mod outbox;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ErrorKind;
use crate::session::entity::SessionState;

pub use outbox::OutboxRelay;

/// Event topics, one ordered queue each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Session,
    Pipeline,
    Recording,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Pipeline => "pipeline",
            Self::Recording => "recording",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session" => Some(Self::Session),
            "pipeline" => Some(Self::Pipeline),
            "recording" => Some(Self::Recording),
            _ => None,
        }
    }
}

/// Events that ride the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    SessionTransitioned {
        session_id: String,
        from: SessionState,
        to: SessionState,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    PipelineStarted {
        pipeline_id: String,
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    PipelineFirstMedia {
        pipeline_id: String,
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    PipelineProgress {
        pipeline_id: String,
        session_id: String,
        segments_written: u64,
        timestamp: DateTime<Utc>,
    },
    PipelineTerminated {
        pipeline_id: String,
        session_id: String,
        exit_code: Option<i32>,
        after_first_media: bool,
        timestamp: DateTime<Utc>,
    },
    PipelineFailed {
        pipeline_id: String,
        session_id: String,
        kind: ErrorKind,
        detail: String,
        timestamp: DateTime<Utc>,
    },
    RecordingTransitioned {
        reference: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::SessionTransitioned { .. } => Topic::Session,
            Self::PipelineStarted { .. }
            | Self::PipelineFirstMedia { .. }
            | Self::PipelineProgress { .. }
            | Self::PipelineTerminated { .. }
            | Self::PipelineFailed { .. } => Topic::Pipeline,
            Self::RecordingTransitioned { .. } => Topic::Recording,
        }
    }

    /// Id of the entity this event is about; ordering is per (topic, entity).
    pub fn entity_id(&self) -> &str {
        match self {
            Self::SessionTransitioned { session_id, .. }
            | Self::PipelineStarted { session_id, .. }
            | Self::PipelineFirstMedia { session_id, .. }
            | Self::PipelineProgress { session_id, .. }
            | Self::PipelineTerminated { session_id, .. }
            | Self::PipelineFailed { session_id, .. } => session_id,
            Self::RecordingTransitioned { reference, .. } => reference,
        }
    }
}

/// Per-topic broadcast bus.
#[derive(Clone)]
pub struct EventBus {
    session: broadcast::Sender<EngineEvent>,
    pipeline: broadcast::Sender<EngineEvent>,
    recording: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with default per-topic capacity (256).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (session, _) = broadcast::channel(capacity);
        let (pipeline, _) = broadcast::channel(capacity);
        let (recording, _) = broadcast::channel(capacity);
        Self {
            session,
            pipeline,
            recording,
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<EngineEvent> {
        match topic {
            Topic::Session => &self.session,
            Topic::Pipeline => &self.pipeline,
            Topic::Recording => &self.recording,
        }
    }

    /// Publish an event to its topic. Lagging or absent subscribers are not
    /// an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender(event.topic()).send(event);
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<EngineEvent> {
        self.sender(topic).subscribe()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.sender(topic).receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
