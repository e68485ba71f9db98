//! SQLite-backed state store.
//!
//! Sessions and recording metadata are stored as JSON aggregates with the
//! columns needed for scans; leases, idempotency keys, and the outbox are
//! plain rows. All compound writes run in a single transaction.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::events::outbox::OutboxEntry;
use crate::lease::{AcquireOutcome, Lease};
use crate::recording::RecordingMeta;
use crate::session::entity::Session;
use crate::store::{
    IdempotencyOutcome, IdempotencyRecord, RecordingUpdateFn, SessionUpdateFn, StateStore,
};

/// Create a connection pool and run migrations.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(Error::DatabaseSqlx)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| Error::Configuration(format!("migration failed: {e}")))?;

    Ok(pool)
}

/// SQLite [`StateStore`] implementation.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Configuration(format!("bad timestamp in store: {e}")))
}

fn ttl_to_expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
}

async fn insert_session_tx(
    tx: &mut sqlx::SqliteConnection,
    session: &Session,
) -> Result<()> {
    let payload = serde_json::to_string(session)?;
    sqlx::query(
        r#"
        INSERT INTO sessions (id, state, heartbeat_deadline, idem_key, payload, created_at, transitioned_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            state = excluded.state,
            heartbeat_deadline = excluded.heartbeat_deadline,
            idem_key = excluded.idem_key,
            payload = excluded.payload,
            transitioned_at = excluded.transitioned_at
        "#,
    )
    .bind(&session.id)
    .bind(session.state.as_str())
    .bind(session.heartbeat_deadline.to_rfc3339())
    .bind(&session.idem_key)
    .bind(payload)
    .bind(session.created_at.to_rfc3339())
    .bind(session.transitioned_at.to_rfc3339())
    .execute(tx)
    .await?;
    Ok(())
}

async fn enqueue_events_tx(
    tx: &mut sqlx::SqliteConnection,
    events: &[EngineEvent],
) -> Result<()> {
    for event in events {
        let payload = serde_json::to_string(event)?;
        sqlx::query(
            "INSERT INTO outbox (topic, entity_id, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(event.topic().as_str())
        .bind(event.entity_id())
        .bind(payload)
        .bind(now_rfc3339())
        .execute(&mut *tx)
        .await?;
    }
    Ok(())
}

fn lease_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Lease> {
    Ok(Lease {
        id: row.get("id"),
        slot: row.get::<i64, _>("slot") as usize,
        owner: row.get("owner"),
        key: row.get("key"),
        expires_at: parse_ts(&row.get::<String, _>("expires_at"))?,
    })
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn put_session(&self, session: &Session) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_session_tx(&mut tx, session).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT payload FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(serde_json::from_str(
                &row.get::<String, _>("payload"),
            )?)),
            None => Ok(None),
        }
    }

    async fn update_session<'a>(&self, id: &str, f: SessionUpdateFn<'a>) -> Result<Session> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT payload FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("session", id))?;
        let mut session: Session = serde_json::from_str(&row.get::<String, _>("payload"))?;
        let events = f(&mut session)?;
        insert_session_tx(&mut tx, &session).await?;
        enqueue_events_tx(&mut tx, &events).await?;
        tx.commit().await?;
        Ok(session)
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn scan_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT payload FROM sessions ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                serde_json::from_str(&row.get::<String, _>("payload")).map_err(Error::from)
            })
            .collect()
    }

    async fn put_session_with_idempotency(
        &self,
        session: &Session,
        idem_key: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<IdempotencyOutcome> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        if let Some(row) = sqlx::query(
            "SELECT key, session_id, fingerprint, expires_at FROM idempotency WHERE key = ?",
        )
        .bind(idem_key)
        .fetch_optional(&mut *tx)
        .await?
        {
            let record = IdempotencyRecord {
                key: row.get("key"),
                session_id: row.get("session_id"),
                fingerprint: row.get("fingerprint"),
                expires_at: parse_ts(&row.get::<String, _>("expires_at"))?,
            };
            if !record.is_expired_at(now) {
                return Ok(IdempotencyOutcome::Replayed(record));
            }
            // Expired entries are lazily removed, never resurrected.
            sqlx::query("DELETE FROM idempotency WHERE key = ?")
                .bind(idem_key)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO idempotency (key, session_id, fingerprint, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(idem_key)
        .bind(&session.id)
        .bind(fingerprint)
        .bind(ttl_to_expiry(ttl).to_rfc3339())
        .execute(&mut *tx)
        .await?;
        insert_session_tx(&mut tx, session).await?;
        tx.commit().await?;
        Ok(IdempotencyOutcome::Created)
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            "SELECT key, session_id, fingerprint, expires_at FROM idempotency WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let record = IdempotencyRecord {
            key: row.get("key"),
            session_id: row.get("session_id"),
            fingerprint: row.get("fingerprint"),
            expires_at: parse_ts(&row.get::<String, _>("expires_at"))?,
        };
        if record.is_expired_at(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn purge_expired_idempotency(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency WHERE expires_at <= ?")
            .bind(now_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        slot_count: usize,
    ) -> Result<AcquireOutcome> {
        let mut tx = self.pool.begin().await?;
        let now = now_rfc3339();
        let expires_at = ttl_to_expiry(ttl);

        sqlx::query("DELETE FROM leases WHERE expires_at <= ?")
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        if let Some(row) = sqlx::query(
            "SELECT id, slot, owner, key, expires_at FROM leases WHERE owner = ? AND key = ?",
        )
        .bind(owner)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?
        {
            let mut lease = lease_from_row(&row)?;
            lease.expires_at = expires_at;
            sqlx::query("UPDATE leases SET expires_at = ? WHERE id = ?")
                .bind(lease.expires_at.to_rfc3339())
                .bind(&lease.id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(AcquireOutcome::Acquired(lease));
        }

        let occupied: Vec<usize> = sqlx::query("SELECT slot FROM leases ORDER BY slot")
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.get::<i64, _>("slot") as usize)
            .collect();
        let Some(slot) = (0..slot_count).find(|s| !occupied.contains(s)) else {
            return Ok(AcquireOutcome::Exhausted);
        };

        let lease = Lease {
            id: uuid::Uuid::new_v4().to_string(),
            slot,
            owner: owner.to_string(),
            key: key.to_string(),
            expires_at,
        };
        sqlx::query("INSERT INTO leases (id, slot, owner, key, expires_at) VALUES (?, ?, ?, ?, ?)")
            .bind(&lease.id)
            .bind(lease.slot as i64)
            .bind(&lease.owner)
            .bind(&lease.key)
            .bind(lease.expires_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(AcquireOutcome::Acquired(lease))
    }

    async fn renew_lease(&self, lease_id: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT id, slot, owner, key, expires_at FROM leases WHERE id = ?")
            .bind(lease_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("lease", lease_id))?;
        let mut lease = lease_from_row(&row)?;
        if lease.owner != owner {
            return Err(Error::precondition("lease held by another owner"));
        }
        if lease.is_expired() {
            return Err(Error::precondition("lease expired; re-acquire required"));
        }
        lease.expires_at = ttl_to_expiry(ttl);
        sqlx::query("UPDATE leases SET expires_at = ? WHERE id = ?")
            .bind(lease.expires_at.to_rfc3339())
            .bind(&lease.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(lease)
    }

    async fn release_lease(&self, lease_id: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE id = ? AND owner = ?")
            .bind(lease_id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn drop_all_leases(&self) -> Result<()> {
        sqlx::query("DELETE FROM leases").execute(&self.pool).await?;
        Ok(())
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        let rows = sqlx::query("SELECT id, slot, owner, key, expires_at FROM leases ORDER BY slot")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(lease_from_row).collect()
    }

    async fn get_recording_meta(&self, reference: &str) -> Result<Option<RecordingMeta>> {
        let row = sqlx::query("SELECT payload FROM recordings WHERE reference = ?")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(serde_json::from_str(
                &row.get::<String, _>("payload"),
            )?)),
            None => Ok(None),
        }
    }

    async fn apply_recording_transition<'a>(
        &self,
        reference: &str,
        f: RecordingUpdateFn<'a>,
    ) -> Result<RecordingMeta> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT payload FROM recordings WHERE reference = ?")
            .bind(reference)
            .fetch_optional(&mut *tx)
            .await?;
        let mut meta = match row {
            Some(row) => serde_json::from_str(&row.get::<String, _>("payload"))?,
            None => RecordingMeta::new(reference),
        };
        let events = f(&mut meta)?;
        let payload = serde_json::to_string(&meta)?;
        sqlx::query(
            r#"
            INSERT INTO recordings (reference, state, payload)
            VALUES (?, ?, ?)
            ON CONFLICT(reference) DO UPDATE SET state = excluded.state, payload = excluded.payload
            "#,
        )
        .bind(reference)
        .bind(meta.state.as_str())
        .bind(payload)
        .execute(&mut *tx)
        .await?;
        enqueue_events_tx(&mut tx, &events).await?;
        tx.commit().await?;
        Ok(meta)
    }

    async fn scan_recording_meta(&self) -> Result<Vec<RecordingMeta>> {
        let rows = sqlx::query("SELECT payload FROM recordings")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                serde_json::from_str(&row.get::<String, _>("payload")).map_err(Error::from)
            })
            .collect()
    }

    async fn enqueue_outbox(&self, topic: &str, entity_id: &str, payload: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO outbox (topic, entity_id, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(topic)
        .bind(entity_id)
        .bind(payload)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn fetch_undelivered(&self, limit: i64) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, entity_id, payload
            FROM outbox
            WHERE delivered_at IS NULL
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| OutboxEntry {
                id: row.get("id"),
                topic: row.get("topic"),
                entity_id: row.get("entity_id"),
                payload: row.get("payload"),
            })
            .collect())
    }

    async fn mark_delivered(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET delivered_at = ?, attempts = attempts + 1, last_error = NULL WHERE id = ?",
        )
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_delivery_failure(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1, last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_delivered_outbox(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM outbox WHERE delivered_at IS NOT NULL AND delivered_at < ?")
                .bind(older_than.to_rfc3339())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
