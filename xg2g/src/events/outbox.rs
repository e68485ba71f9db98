//! Durable outbox relay.
//!
//! State transitions are enqueued into the outbox inside the same store
//! transaction as the state write. The relay drains undelivered entries onto
//! the bus and marks them delivered, so a crash between the state write and
//! the fanout is recovered on restart (at-least-once).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::store::StateStore;

/// A persisted, not-yet-delivered event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub topic: String,
    pub entity_id: String,
    pub payload: String,
}

/// Drains the durable outbox onto the in-process bus.
pub struct OutboxRelay {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    poll_interval: Duration,
    batch_size: i64,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn StateStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            poll_interval: Duration::from_millis(100),
            batch_size: 64,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Deliver one batch of undelivered entries. Returns how many were
    /// published.
    pub async fn drain_once(&self) -> Result<usize> {
        let entries = self.store.fetch_undelivered(self.batch_size).await?;
        let mut delivered = 0usize;
        for entry in entries {
            match serde_json::from_str::<EngineEvent>(&entry.payload) {
                Ok(event) => {
                    self.bus.publish(event);
                    self.store.mark_delivered(entry.id).await?;
                    delivered += 1;
                }
                Err(e) => {
                    // Poison entries are recorded and retried; the purge sweep
                    // eventually drops them.
                    warn!(id = entry.id, error = %e, "undeliverable outbox entry");
                    self.store
                        .record_delivery_failure(entry.id, &e.to_string())
                        .await?;
                }
            }
        }
        Ok(delivered)
    }

    /// Run the relay until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        debug!(interval_ms = self.poll_interval.as_millis() as u64, "outbox relay started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.drain_once().await {
                        warn!(error = %e, "outbox drain failed");
                    }
                }
            }
        }
        // Final drain so transitions persisted during shutdown still fan out.
        if let Err(e) = self.drain_once().await {
            warn!(error = %e, "final outbox drain failed");
        }
        debug!("outbox relay stopped");
    }
}
