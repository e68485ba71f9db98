//! Durable recording artifact lifecycle.
//!
//! Decoupled from playback sessions: DVR jobs and duration probes drive the
//! metadata forward, playback only reads it.

pub mod scanner;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::store::StateStore;

/// Recording lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingState {
    Unknown,
    Probing,
    Preparing,
    ReadyPartial,
    ReadyFinal,
    Failed,
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Probing => "PROBING",
            Self::Preparing => "PREPARING",
            Self::ReadyPartial => "READY_PARTIAL",
            Self::ReadyFinal => "READY_FINAL",
            Self::Failed => "FAILED",
        }
    }

    /// The exhaustive transition table.
    pub fn can_transition_to(&self, to: RecordingState) -> bool {
        use RecordingState::*;
        matches!(
            (self, to),
            (Unknown, Probing | Preparing)
                | (Probing, Preparing | Failed)
                | (Preparing, ReadyPartial | ReadyFinal | Failed)
                | (ReadyPartial, ReadyFinal | Failed)
                | (ReadyFinal, Failed)
                | (Failed, Preparing | ReadyPartial | ReadyFinal)
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::ReadyPartial | Self::ReadyFinal)
    }
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a duration value came from. Only `CONTAINER` (and `INDEX` when
/// policy enables it) may finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DurationSource {
    Container,
    Index,
    Metadata,
    Unknown,
}

/// A proposed duration write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationUpdate {
    pub seconds: f64,
    pub source: DurationSource,
    pub is_final: bool,
}

/// What happened to a duration write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationOutcome {
    Applied,
    /// Equal value, or same final value re-written.
    NoOp,
    /// Non-final update below the minimum delta.
    Suppressed,
}

/// Duration acceptance policy.
#[derive(Debug, Clone, Copy)]
pub struct DurationPolicy {
    pub min_delta: Duration,
    pub index_final: bool,
}

impl DurationPolicy {
    fn final_allowed(&self, source: DurationSource) -> bool {
        match source {
            DurationSource::Container => true,
            DurationSource::Index => self.index_final,
            DurationSource::Metadata | DurationSource::Unknown => false,
        }
    }
}

/// Durable recording metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingMeta {
    /// Canonical service reference.
    pub reference: String,
    pub state: RecordingState,
    pub duration_seconds: Option<f64>,
    pub duration_final: bool,
    pub duration_source: DurationSource,
    pub playlist_path: Option<String>,
    pub size_bytes: u64,
    /// Set while a DVR job owns the recording (RECORDING/FINISHING).
    pub dvr_owned: bool,
    pub last_error: Option<String>,
    pub last_transition: DateTime<Utc>,
    /// Last duration/artifact write; the scanner's stable window keys off it.
    pub last_write: DateTime<Utc>,
    pub attempt: u32,
}

impl RecordingMeta {
    pub fn new(reference: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            reference: reference.into(),
            state: RecordingState::Unknown,
            duration_seconds: None,
            duration_final: false,
            duration_source: DurationSource::Unknown,
            playlist_path: None,
            size_bytes: 0,
            dvr_owned: false,
            last_error: None,
            last_transition: now,
            last_write: now,
            attempt: 0,
        }
    }

    /// Apply a state transition per the table.
    ///
    /// Entering `READY_FINAL` requires a finalized duration; entering
    /// `FAILED` releases the finality lock so recovery can re-finalize.
    pub fn transition(&mut self, to: RecordingState) -> Result<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition_to(to) {
            return Err(Error::invalid_transition(
                self.state.as_str(),
                to.as_str(),
            ));
        }
        if to == RecordingState::ReadyFinal
            && !(self.duration_final && self.duration_seconds.is_some())
        {
            return Err(Error::precondition(
                "READY_FINAL requires a finalized duration",
            ));
        }
        if to == RecordingState::Failed {
            self.duration_final = false;
        }
        self.state = to;
        self.last_transition = Utc::now();
        Ok(())
    }

    /// Apply a duration write under the hard rules: finality lock,
    /// monotonicity, small-delta suppression, and source gating.
    pub fn apply_duration(
        &mut self,
        update: DurationUpdate,
        policy: &DurationPolicy,
    ) -> Result<DurationOutcome> {
        if !update.seconds.is_finite() || update.seconds < 0.0 {
            return Err(Error::precondition("duration must be a non-negative number"));
        }
        if update.is_final && !policy.final_allowed(update.source) {
            return Err(Error::precondition(format!(
                "source {:?} may not finalize a duration",
                update.source
            )));
        }

        if self.state == RecordingState::ReadyFinal {
            let current = self.duration_seconds.unwrap_or(0.0);
            if (update.seconds - current).abs() < f64::EPSILON {
                return Ok(DurationOutcome::NoOp);
            }
            return Err(Error::precondition(
                "duration is finalized and cannot change",
            ));
        }

        if let Some(current) = self.duration_seconds {
            if update.seconds < current {
                return Err(Error::precondition("duration must not decrease"));
            }
            if (update.seconds - current).abs() < f64::EPSILON {
                if update.is_final && !self.duration_final {
                    // Same value, now final: finalize without changing it.
                    self.duration_final = true;
                    self.duration_source = update.source;
                    self.last_write = Utc::now();
                    return Ok(DurationOutcome::Applied);
                }
                return Ok(DurationOutcome::NoOp);
            }
            let delta = update.seconds - current;
            if !update.is_final && delta < policy.min_delta.as_secs_f64() {
                return Ok(DurationOutcome::Suppressed);
            }
        }

        self.duration_seconds = Some(update.seconds);
        self.duration_final = update.is_final;
        self.duration_source = update.source;
        self.last_write = Utc::now();
        Ok(DurationOutcome::Applied)
    }
}

/// Service wrapping the store for recording transitions.
///
/// Every mutation goes through a single store transaction that also enqueues
/// the transition event into the outbox.
pub struct RecordingService {
    store: Arc<dyn StateStore>,
    policy: DurationPolicy,
}

impl RecordingService {
    pub fn new(store: Arc<dyn StateStore>, policy: DurationPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> DurationPolicy {
        self.policy
    }

    pub async fn get(&self, reference: &str) -> Result<Option<RecordingMeta>> {
        self.store.get_recording_meta(reference).await
    }

    /// Record a duration observation, moving the state machine forward when
    /// the write lands.
    pub async fn record_duration(
        &self,
        reference: &str,
        update: DurationUpdate,
    ) -> Result<(RecordingMeta, DurationOutcome)> {
        let policy = self.policy;
        let mut outcome = DurationOutcome::NoOp;
        let meta = self
            .store
            .apply_recording_transition(reference, &mut |meta: &mut RecordingMeta| {
                outcome = meta.apply_duration(update, &policy)?;
                if outcome != DurationOutcome::Applied {
                    return Ok(Vec::new());
                }
                let from = meta.state;
                if meta.state == RecordingState::Unknown {
                    meta.transition(RecordingState::Preparing)?;
                }
                let target = if meta.duration_final {
                    RecordingState::ReadyFinal
                } else {
                    RecordingState::ReadyPartial
                };
                if meta.state != target && meta.state.can_transition_to(target) {
                    meta.transition(target)?;
                }
                Ok(transition_events(reference, from, meta.state))
            })
            .await?;
        Ok((meta, outcome))
    }

    /// Begin a probe: `UNKNOWN → PROBING`, bumping the attempt counter.
    pub async fn begin_probe(&self, reference: &str) -> Result<RecordingMeta> {
        self.store
            .apply_recording_transition(reference, &mut |meta: &mut RecordingMeta| {
                let from = meta.state;
                meta.transition(RecordingState::Probing)?;
                meta.attempt += 1;
                Ok(transition_events(reference, from, meta.state))
            })
            .await
    }

    /// Record produced artifacts (playlist + total size) and move the state
    /// machine to `READY_PARTIAL`, or `READY_FINAL` when the duration is
    /// already finalized.
    pub async fn mark_prepared(
        &self,
        reference: &str,
        playlist_path: &str,
        size_bytes: u64,
    ) -> Result<RecordingMeta> {
        self.store
            .apply_recording_transition(reference, &mut |meta: &mut RecordingMeta| {
                let from = meta.state;
                if matches!(
                    meta.state,
                    RecordingState::Unknown | RecordingState::Probing | RecordingState::Failed
                ) {
                    meta.transition(RecordingState::Preparing)?;
                }
                meta.playlist_path = Some(playlist_path.to_string());
                meta.size_bytes = size_bytes;
                meta.last_write = Utc::now();

                let target = if meta.duration_final && meta.duration_seconds.is_some() {
                    RecordingState::ReadyFinal
                } else {
                    RecordingState::ReadyPartial
                };
                if meta.state != target && meta.state.can_transition_to(target) {
                    meta.transition(target)?;
                }
                Ok(transition_events(reference, from, meta.state))
            })
            .await
    }

    /// Mark a recording failed with a cause. Used when the upstream file
    /// disappears or preparation breaks down.
    pub async fn mark_failed(&self, reference: &str, detail: &str) -> Result<RecordingMeta> {
        let meta = self
            .store
            .apply_recording_transition(reference, &mut |meta: &mut RecordingMeta| {
                let from = meta.state;
                // UNKNOWN has no edge to FAILED; route through PROBING.
                if meta.state == RecordingState::Unknown {
                    meta.transition(RecordingState::Probing)?;
                }
                meta.transition(RecordingState::Failed)?;
                meta.last_error = Some(detail.to_string());
                Ok(transition_events(reference, from, meta.state))
            })
            .await?;
        info!(reference = %reference, detail = %detail, "recording marked failed");
        Ok(meta)
    }

    /// Set or clear DVR ownership.
    pub async fn set_dvr_owned(&self, reference: &str, owned: bool) -> Result<RecordingMeta> {
        self.store
            .apply_recording_transition(reference, &mut |meta: &mut RecordingMeta| {
                meta.dvr_owned = owned;
                Ok(Vec::new())
            })
            .await
    }
}

fn transition_events(
    reference: &str,
    from: RecordingState,
    to: RecordingState,
) -> Vec<EngineEvent> {
    if from == to {
        return Vec::new();
    }
    vec![EngineEvent::RecordingTransitioned {
        reference: reference.to_string(),
        from: from.as_str().to_string(),
        to: to.as_str().to_string(),
        timestamp: Utc::now(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn policy() -> DurationPolicy {
        DurationPolicy {
            min_delta: Duration::from_secs(2),
            index_final: false,
        }
    }

    fn update(seconds: f64, source: DurationSource, is_final: bool) -> DurationUpdate {
        DurationUpdate {
            seconds,
            source,
            is_final,
        }
    }

    fn service() -> RecordingService {
        RecordingService::new(Arc::new(MemoryStore::new()), policy())
    }

    #[test]
    fn transition_table_is_exhaustive() {
        use RecordingState::*;
        let allowed = [
            (Unknown, Probing),
            (Unknown, Preparing),
            (Probing, Preparing),
            (Probing, Failed),
            (Preparing, ReadyPartial),
            (Preparing, ReadyFinal),
            (Preparing, Failed),
            (ReadyPartial, ReadyFinal),
            (ReadyPartial, Failed),
            (ReadyFinal, Failed),
            (Failed, Preparing),
            (Failed, ReadyPartial),
            (Failed, ReadyFinal),
        ];
        let all = [Unknown, Probing, Preparing, ReadyPartial, ReadyFinal, Failed];
        for from in all {
            for to in all {
                let expect = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expect,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn ready_final_requires_final_duration() {
        let mut meta = RecordingMeta::new("ref-1");
        meta.transition(RecordingState::Preparing).unwrap();
        assert!(meta.transition(RecordingState::ReadyFinal).is_err());
        meta.apply_duration(update(3600.0, DurationSource::Container, true), &policy())
            .unwrap();
        meta.transition(RecordingState::ReadyFinal).unwrap();
    }

    #[test]
    fn finality_lock_rejects_different_values() {
        let mut meta = RecordingMeta::new("ref-1");
        meta.transition(RecordingState::Preparing).unwrap();
        meta.apply_duration(update(3600.0, DurationSource::Container, true), &policy())
            .unwrap();
        meta.transition(RecordingState::ReadyFinal).unwrap();

        // Same value: idempotent no-op.
        assert_eq!(
            meta.apply_duration(update(3600.0, DurationSource::Container, true), &policy())
                .unwrap(),
            DurationOutcome::NoOp
        );
        // Different value: rejected.
        assert!(
            meta.apply_duration(update(3601.0, DurationSource::Index, false), &policy())
                .is_err()
        );
        assert_eq!(meta.duration_seconds, Some(3600.0));
    }

    #[test]
    fn duration_must_not_decrease() {
        let mut meta = RecordingMeta::new("ref-1");
        meta.apply_duration(update(100.0, DurationSource::Index, false), &policy())
            .unwrap();
        assert!(
            meta.apply_duration(update(50.0, DurationSource::Index, false), &policy())
                .is_err()
        );
    }

    #[test]
    fn small_deltas_are_suppressed_unless_final() {
        let mut meta = RecordingMeta::new("ref-1");
        meta.apply_duration(update(100.0, DurationSource::Index, false), &policy())
            .unwrap();
        assert_eq!(
            meta.apply_duration(update(101.0, DurationSource::Index, false), &policy())
                .unwrap(),
            DurationOutcome::Suppressed
        );
        assert_eq!(meta.duration_seconds, Some(100.0));
        // A final CONTAINER write at a small delta still lands.
        assert_eq!(
            meta.apply_duration(update(101.0, DurationSource::Container, true), &policy())
                .unwrap(),
            DurationOutcome::Applied
        );
        assert!(meta.duration_final);
    }

    #[test]
    fn source_gating_blocks_non_container_finals() {
        let mut meta = RecordingMeta::new("ref-1");
        assert!(
            meta.apply_duration(update(10.0, DurationSource::Metadata, true), &policy())
                .is_err()
        );
        assert!(
            meta.apply_duration(update(10.0, DurationSource::Index, true), &policy())
                .is_err()
        );
        // Policy can open INDEX up.
        let open = DurationPolicy {
            min_delta: Duration::from_secs(2),
            index_final: true,
        };
        assert_eq!(
            meta.apply_duration(update(10.0, DurationSource::Index, true), &open)
                .unwrap(),
            DurationOutcome::Applied
        );
    }

    #[test]
    fn failed_releases_the_finality_lock() {
        let mut meta = RecordingMeta::new("ref-1");
        meta.transition(RecordingState::Preparing).unwrap();
        meta.apply_duration(update(3600.0, DurationSource::Container, true), &policy())
            .unwrap();
        meta.transition(RecordingState::ReadyFinal).unwrap();
        meta.transition(RecordingState::Failed).unwrap();
        assert!(!meta.duration_final);
        // Recovery can finalize again.
        meta.apply_duration(update(3600.0, DurationSource::Container, true), &policy())
            .unwrap();
        meta.transition(RecordingState::ReadyFinal).unwrap();
    }

    #[tokio::test]
    async fn service_finalization_scenario() {
        let service = service();
        // INDEX updates grow the duration monotonically.
        service
            .record_duration("ref-1", update(100.0, DurationSource::Index, false))
            .await
            .unwrap();
        let (meta, _) = service
            .record_duration("ref-1", update(200.0, DurationSource::Index, false))
            .await
            .unwrap();
        assert_eq!(meta.state, RecordingState::ReadyPartial);

        // CONTAINER finalizes at 3600.
        let (meta, outcome) = service
            .record_duration("ref-1", update(3600.0, DurationSource::Container, true))
            .await
            .unwrap();
        assert_eq!(outcome, DurationOutcome::Applied);
        assert_eq!(meta.state, RecordingState::ReadyFinal);

        // A later INDEX update of 3601 is rejected.
        assert!(
            service
                .record_duration("ref-1", update(3601.0, DurationSource::Index, false))
                .await
                .is_err()
        );
        let meta = service.get("ref-1").await.unwrap().unwrap();
        assert_eq!(meta.duration_seconds, Some(3600.0));
        assert_eq!(meta.state, RecordingState::ReadyFinal);
    }

    #[tokio::test]
    async fn dvr_ownership_toggles() {
        let service = service();
        let meta = service.set_dvr_owned("ref-1", true).await.unwrap();
        assert!(meta.dvr_owned);
        let meta = service.set_dvr_owned("ref-1", false).await.unwrap();
        assert!(!meta.dvr_owned);
    }

    #[tokio::test]
    async fn mark_prepared_moves_to_ready() {
        let service = service();
        let meta = service
            .mark_prepared("ref-1", "/srv/hls/s-1/index.m3u8", 2048)
            .await
            .unwrap();
        assert_eq!(meta.state, RecordingState::ReadyPartial);
        assert_eq!(meta.size_bytes, 2048);

        // With a finalized duration the same call lands on READY_FINAL.
        service
            .record_duration("ref-2", update(3600.0, DurationSource::Container, true))
            .await
            .unwrap();
        let meta = service
            .mark_prepared("ref-2", "/srv/hls/s-2/index.m3u8", 4096)
            .await
            .unwrap();
        assert_eq!(meta.state, RecordingState::ReadyFinal);
    }

    #[tokio::test]
    async fn mark_failed_records_cause() {
        let service = service();
        let meta = service.mark_failed("ref-1", "recording_deleted").await.unwrap();
        assert_eq!(meta.state, RecordingState::Failed);
        assert_eq!(meta.last_error.as_deref(), Some("recording_deleted"));
    }
}
