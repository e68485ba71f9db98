//! Durable state store.
//!
//! A key-value store with transactional single-key writes and scoped
//! multi-key transactions for the (session, idempotency) coupling. Two
//! implementations share this interface: [`memory::MemoryStore`] for tests
//! and [`sqlite::SqliteStore`] (embedded file-backed B-tree) for production.
//!
//! Update closures run inside the store transaction; the events they return
//! are enqueued into the outbox atomically with the state write, which is
//! what makes the write-ahead discipline hold across crashes.

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::EngineEvent;
use crate::events::outbox::OutboxEntry;
use crate::lease::{AcquireOutcome, Lease};
use crate::recording::RecordingMeta;
use crate::session::entity::Session;

/// Mutation closure for a session; returns the events to enqueue with the
/// write.
pub type SessionUpdateFn<'a> =
    &'a mut (dyn FnMut(&mut Session) -> Result<Vec<EngineEvent>> + Send);

/// Mutation closure for recording metadata.
pub type RecordingUpdateFn<'a> =
    &'a mut (dyn FnMut(&mut RecordingMeta) -> Result<Vec<EngineEvent>> + Send);

/// `idemKey → session` reservation with TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub session_id: String,
    /// SHA-256 hex over the normalized intent payload.
    pub fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of the atomic (session, idempotency) write.
#[derive(Debug, Clone)]
pub enum IdempotencyOutcome {
    /// Key was unset; session and reservation are persisted.
    Created,
    /// Key was already reserved; nothing was written. The caller decides
    /// between replay and conflict by comparing fingerprints.
    Replayed(IdempotencyRecord),
}

/// Durable state store interface.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Cheap liveness check for readiness reporting.
    async fn ping(&self) -> Result<()>;

    // Sessions
    async fn put_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;
    /// Transactionally mutate a session; the closure's events are enqueued
    /// into the outbox with the write.
    async fn update_session<'a>(&self, id: &str, f: SessionUpdateFn<'a>) -> Result<Session>;
    async fn delete_session(&self, id: &str) -> Result<()>;
    async fn scan_sessions(&self) -> Result<Vec<Session>>;

    /// Atomic: reserve `idem_key` (only if unset or expired) and write the
    /// session. Never partially applied.
    async fn put_session_with_idempotency(
        &self,
        session: &Session,
        idem_key: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<IdempotencyOutcome>;
    /// Unexpired reservation for a key, if any. Expired entries are treated
    /// as absent and never resurrected.
    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>>;
    async fn purge_expired_idempotency(&self) -> Result<u64>;

    // Leases
    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        slot_count: usize,
    ) -> Result<AcquireOutcome>;
    async fn renew_lease(&self, lease_id: &str, owner: &str, ttl: Duration) -> Result<Lease>;
    async fn release_lease(&self, lease_id: &str, owner: &str) -> Result<()>;
    async fn drop_all_leases(&self) -> Result<()>;
    async fn list_leases(&self) -> Result<Vec<Lease>>;

    // Recording metadata
    async fn get_recording_meta(&self, reference: &str) -> Result<Option<RecordingMeta>>;
    /// Transactionally mutate recording metadata, creating the UNKNOWN
    /// default when the reference is new.
    async fn apply_recording_transition<'a>(
        &self,
        reference: &str,
        f: RecordingUpdateFn<'a>,
    ) -> Result<RecordingMeta>;
    async fn scan_recording_meta(&self) -> Result<Vec<RecordingMeta>>;

    // Outbox
    async fn enqueue_outbox(&self, topic: &str, entity_id: &str, payload: &str) -> Result<i64>;
    async fn fetch_undelivered(&self, limit: i64) -> Result<Vec<OutboxEntry>>;
    async fn mark_delivered(&self, id: i64) -> Result<()>;
    async fn record_delivery_failure(&self, id: i64, error: &str) -> Result<()>;
    async fn purge_delivered_outbox(&self, older_than: DateTime<Utc>) -> Result<u64>;
}
