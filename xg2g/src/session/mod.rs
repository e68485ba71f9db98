//! Playback sessions: entity, authoritative state machine, and background
//! maintenance (reaper + cache evicter).

pub mod entity;
pub mod manager;
pub mod reaper;

pub use entity::{IntentKind, PlayIntent, PlaybackMode, Session, SessionState};
pub use manager::{HeartbeatSnapshot, SessionManager, SessionManagerConfig};
