//! In-memory state store for tests.
//!
//! Same semantics as the SQLite store, one mutex over the whole state. Every
//! operation is atomic by construction.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::events::outbox::OutboxEntry;
use crate::lease::{AcquireOutcome, Lease};
use crate::recording::RecordingMeta;
use crate::session::entity::Session;
use crate::store::{
    IdempotencyOutcome, IdempotencyRecord, RecordingUpdateFn, SessionUpdateFn, StateStore,
};

#[derive(Debug, Clone)]
struct OutboxRow {
    id: i64,
    topic: String,
    entity_id: String,
    payload: String,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    attempts: u32,
    last_error: Option<String>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    idempotency: HashMap<String, IdempotencyRecord>,
    leases: HashMap<String, Lease>,
    recordings: HashMap<String, RecordingMeta>,
    outbox: Vec<OutboxRow>,
    next_outbox_id: i64,
}

/// In-memory [`StateStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_outbox(inner: &mut Inner, topic: &str, entity_id: &str, payload: &str) -> i64 {
        inner.next_outbox_id += 1;
        let id = inner.next_outbox_id;
        inner.outbox.push(OutboxRow {
            id,
            topic: topic.to_string(),
            entity_id: entity_id.to_string(),
            payload: payload.to_string(),
            created_at: Utc::now(),
            delivered_at: None,
            attempts: 0,
            last_error: None,
        });
        id
    }

    fn enqueue_events(
        inner: &mut Inner,
        events: Vec<crate::events::EngineEvent>,
    ) -> Result<()> {
        for event in events {
            let payload = serde_json::to_string(&event)?;
            Self::push_outbox(
                inner,
                event.topic().as_str(),
                event.entity_id(),
                &payload,
            );
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn put_session(&self, session: &Session) -> Result<()> {
        self.inner
            .lock()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.inner.lock().sessions.get(id).cloned())
    }

    async fn update_session<'a>(&self, id: &str, f: SessionUpdateFn<'a>) -> Result<Session> {
        let mut inner = self.inner.lock();
        let mut session = inner
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("session", id))?;
        let events = f(&mut session)?;
        inner.sessions.insert(id.to_string(), session.clone());
        Self::enqueue_events(&mut inner, events)?;
        Ok(session)
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        self.inner.lock().sessions.remove(id);
        Ok(())
    }

    async fn scan_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.inner.lock().sessions.values().cloned().collect())
    }

    async fn put_session_with_idempotency(
        &self,
        session: &Session,
        idem_key: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<IdempotencyOutcome> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        if let Some(existing) = inner.idempotency.get(idem_key)
            && !existing.is_expired_at(now)
        {
            return Ok(IdempotencyOutcome::Replayed(existing.clone()));
        }
        let record = IdempotencyRecord {
            key: idem_key.to_string(),
            session_id: session.id.clone(),
            fingerprint: fingerprint.to_string(),
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        };
        inner.idempotency.insert(idem_key.to_string(), record);
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(IdempotencyOutcome::Created)
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let now = Utc::now();
        Ok(self
            .inner
            .lock()
            .idempotency
            .get(key)
            .filter(|r| !r.is_expired_at(now))
            .cloned())
    }

    async fn purge_expired_idempotency(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let before = inner.idempotency.len();
        inner.idempotency.retain(|_, r| !r.is_expired_at(now));
        Ok((before - inner.idempotency.len()) as u64)
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        slot_count: usize,
    ) -> Result<AcquireOutcome> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

        // Expiry enforcement happens at the table, whether or not owners
        // cooperate.
        inner.leases.retain(|_, l| !l.is_expired_at(now));

        // Re-entry: same owner on the same key renews in place.
        if let Some(existing) = inner
            .leases
            .values_mut()
            .find(|l| l.owner == owner && l.key == key)
        {
            existing.expires_at = expires_at;
            return Ok(AcquireOutcome::Acquired(existing.clone()));
        }

        let occupied: Vec<usize> = inner.leases.values().map(|l| l.slot).collect();
        let slot = (0..slot_count).find(|s| !occupied.contains(s));
        let Some(slot) = slot else {
            return Ok(AcquireOutcome::Exhausted);
        };

        let lease = Lease {
            id: uuid::Uuid::new_v4().to_string(),
            slot,
            owner: owner.to_string(),
            key: key.to_string(),
            expires_at,
        };
        inner.leases.insert(lease.id.clone(), lease.clone());
        Ok(AcquireOutcome::Acquired(lease))
    }

    async fn renew_lease(&self, lease_id: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let lease = inner
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| Error::not_found("lease", lease_id))?;
        if lease.owner != owner {
            return Err(Error::precondition("lease held by another owner"));
        }
        if lease.is_expired_at(now) {
            return Err(Error::precondition("lease expired; re-acquire required"));
        }
        lease.expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        Ok(lease.clone())
    }

    async fn release_lease(&self, lease_id: &str, owner: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(lease) = inner.leases.get(lease_id)
            && lease.owner == owner
        {
            inner.leases.remove(lease_id);
        }
        Ok(())
    }

    async fn drop_all_leases(&self) -> Result<()> {
        self.inner.lock().leases.clear();
        Ok(())
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        Ok(self.inner.lock().leases.values().cloned().collect())
    }

    async fn get_recording_meta(&self, reference: &str) -> Result<Option<RecordingMeta>> {
        Ok(self.inner.lock().recordings.get(reference).cloned())
    }

    async fn apply_recording_transition<'a>(
        &self,
        reference: &str,
        f: RecordingUpdateFn<'a>,
    ) -> Result<RecordingMeta> {
        let mut inner = self.inner.lock();
        let mut meta = inner
            .recordings
            .get(reference)
            .cloned()
            .unwrap_or_else(|| RecordingMeta::new(reference));
        let events = f(&mut meta)?;
        inner.recordings.insert(reference.to_string(), meta.clone());
        Self::enqueue_events(&mut inner, events)?;
        Ok(meta)
    }

    async fn scan_recording_meta(&self) -> Result<Vec<RecordingMeta>> {
        Ok(self.inner.lock().recordings.values().cloned().collect())
    }

    async fn enqueue_outbox(&self, topic: &str, entity_id: &str, payload: &str) -> Result<i64> {
        let mut inner = self.inner.lock();
        Ok(Self::push_outbox(&mut inner, topic, entity_id, payload))
    }

    async fn fetch_undelivered(&self, limit: i64) -> Result<Vec<OutboxEntry>> {
        Ok(self
            .inner
            .lock()
            .outbox
            .iter()
            .filter(|row| row.delivered_at.is_none())
            .take(limit.max(0) as usize)
            .map(|row| OutboxEntry {
                id: row.id,
                topic: row.topic.clone(),
                entity_id: row.entity_id.clone(),
                payload: row.payload.clone(),
            })
            .collect())
    }

    async fn mark_delivered(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.outbox.iter_mut().find(|r| r.id == id) {
            row.delivered_at = Some(Utc::now());
            row.attempts += 1;
            row.last_error = None;
        }
        Ok(())
    }

    async fn record_delivery_failure(&self, id: i64, error: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.outbox.iter_mut().find(|r| r.id == id) {
            row.attempts += 1;
            row.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn purge_delivered_outbox(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.outbox.len();
        inner
            .outbox
            .retain(|row| row.delivered_at.is_none_or(|d| d >= older_than));
        Ok((before - inner.outbox.len()) as u64)
    }
}
