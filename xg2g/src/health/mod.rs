//! Coarse health classification for `/readyz` and diagnostics.

use std::sync::Arc;

use serde::Serialize;

use crate::store::StateStore;
use crate::upstream::UpstreamClient;

/// Coarse health classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// One subsystem down, others up. Still serving.
    Degraded,
    /// Total unavailability.
    Unavailable,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Per-component verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Aggregate health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

/// Checks the engine's hard dependencies.
pub struct HealthChecker {
    store: Arc<dyn StateStore>,
    upstream: Arc<dyn UpstreamClient>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn StateStore>, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self { store, upstream }
    }

    pub async fn check_all(&self) -> SystemHealth {
        let mut components = Vec::with_capacity(2);

        let store_ok = match self.store.ping().await {
            Ok(()) => {
                components.push(ComponentHealth {
                    name: "store".into(),
                    healthy: true,
                    message: None,
                });
                true
            }
            Err(e) => {
                components.push(ComponentHealth {
                    name: "store".into(),
                    healthy: false,
                    message: Some(e.to_string()),
                });
                false
            }
        };

        let upstream_ok = match self.upstream.ping().await {
            Ok(()) => {
                components.push(ComponentHealth {
                    name: "upstream".into(),
                    healthy: true,
                    message: None,
                });
                true
            }
            Err(e) => {
                components.push(ComponentHealth {
                    name: "upstream".into(),
                    healthy: false,
                    message: Some(e.to_string()),
                });
                false
            }
        };

        // The store is load-bearing for every session operation; losing it is
        // total unavailability. A dark upstream still serves existing
        // sessions and finished recordings.
        let status = match (store_ok, upstream_ok) {
            (true, true) => HealthStatus::Healthy,
            (true, false) => HealthStatus::Degraded,
            (false, _) => HealthStatus::Unavailable,
        };

        SystemHealth { status, components }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::upstream::MockUpstream;

    #[tokio::test]
    async fn healthy_when_everything_answers() {
        let checker = HealthChecker::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockUpstream::new()),
        );
        let health = checker.check_all().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.components.len(), 2);
    }

    #[tokio::test]
    async fn dark_upstream_degrades() {
        let upstream = Arc::new(MockUpstream::new());
        upstream.set_reachable(false);
        let checker = HealthChecker::new(Arc::new(MemoryStore::new()), upstream);
        let health = checker.check_all().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(
            health
                .components
                .iter()
                .any(|c| c.name == "upstream" && !c.healthy)
        );
    }
}
