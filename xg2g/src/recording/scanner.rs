//! Library scan gating.
//!
//! The library scanner only considers finalized recordings that have settled:
//! `READY_FINAL`, last write older than the stable window, nonzero size, and
//! no active DVR ownership. A recording being written by the DVR is never
//! scanned.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::recording::{RecordingMeta, RecordingState};
use crate::store::StateStore;

/// Decides which recordings the library may pick up.
pub struct LibraryScanner {
    store: Arc<dyn StateStore>,
    stable_window: Duration,
}

impl LibraryScanner {
    pub fn new(store: Arc<dyn StateStore>, stable_window: Duration) -> Self {
        Self {
            store,
            stable_window,
        }
    }

    /// Scan eligibility for a single recording at `now`.
    pub fn eligible(&self, meta: &RecordingMeta, now: DateTime<Utc>) -> bool {
        if meta.state != RecordingState::ReadyFinal {
            return false;
        }
        if meta.dvr_owned {
            return false;
        }
        if meta.size_bytes == 0 {
            return false;
        }
        let stable =
            chrono::Duration::from_std(self.stable_window).unwrap_or(chrono::Duration::zero());
        meta.last_write + stable <= now
    }

    /// All scan-eligible recordings.
    pub async fn scan(&self) -> Result<Vec<RecordingMeta>> {
        let now = Utc::now();
        Ok(self
            .store
            .scan_recording_meta()
            .await?
            .into_iter()
            .filter(|meta| self.eligible(meta, now))
            .collect())
    }
}
