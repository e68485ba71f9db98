//! Tuner lease arbitration.
//!
//! Tuner slots are a small, operator-configured set; at most one active lease
//! per slot. The arbiter is non-blocking: exhaustion is reported immediately
//! and retry timing is the client's responsibility via the `Retry-After`
//! contract.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::store::StateStore;

/// A time-bounded exclusive claim on a tuner slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    /// Slot index, `0..slot_count`.
    pub slot: usize,
    /// Session that owns the lease.
    pub owner: String,
    /// Logical resource key: serviceRef for live, recording reference for
    /// recordings.
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Outcome of a non-blocking acquire.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Acquired(Lease),
    /// Every slot holds an unexpired lease.
    Exhausted,
}

/// Allocates bounded tuner slots with TTL leases.
///
/// Slot selection is deterministic (lowest free index). Re-entry is allowed:
/// an owner re-acquiring its own key gets its existing lease renewed. The
/// slot table lives in the state store so diagnostics survive the process;
/// clean startup calls [`LeaseArbiter::drop_all`] and never trusts persisted
/// leases.
pub struct LeaseArbiter {
    store: Arc<dyn StateStore>,
    slot_count: usize,
    default_ttl: Duration,
}

impl LeaseArbiter {
    pub fn new(store: Arc<dyn StateStore>, slot_count: usize, default_ttl: Duration) -> Self {
        Self {
            store,
            slot_count,
            default_ttl,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Try to acquire a lease on `key` for `owner`.
    ///
    /// Never blocks; callers surface exhaustion as `LEASE_BUSY`.
    pub async fn try_acquire(&self, key: &str, owner: &str) -> Result<AcquireOutcome> {
        let outcome = self
            .store
            .try_acquire_lease(key, owner, self.default_ttl, self.slot_count)
            .await?;
        match &outcome {
            AcquireOutcome::Acquired(lease) => {
                debug!(lease_id = %lease.id, slot = lease.slot, owner = %owner, "lease acquired");
            }
            AcquireOutcome::Exhausted => {
                debug!(owner = %owner, key = %key, "tuner slots exhausted");
            }
        }
        Ok(outcome)
    }

    /// Renew a lease, preserving its id and advancing `expires_at`.
    ///
    /// Fails if the holder does not match or the lease has already expired;
    /// expired leases must be re-acquired so a crashed owner cannot silently
    /// extend.
    pub async fn renew(&self, lease_id: &str, owner: &str) -> Result<Lease> {
        self.store
            .renew_lease(lease_id, owner, self.default_ttl)
            .await
    }

    /// Release a lease. No-op if the holder does not match; idempotent.
    pub async fn release(&self, lease_id: &str, owner: &str) -> Result<()> {
        self.store.release_lease(lease_id, owner).await
    }

    /// Administrative reset; used on clean startup and operator request.
    pub async fn drop_all(&self) -> Result<()> {
        self.store.drop_all_leases().await?;
        info!("all tuner leases dropped");
        Ok(())
    }

    /// Unexpired leases, for diagnostics.
    pub async fn active(&self) -> Result<Vec<Lease>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_leases()
            .await?
            .into_iter()
            .filter(|l| !l.is_expired_at(now))
            .collect())
    }
}
