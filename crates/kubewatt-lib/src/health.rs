//! Liveness and readiness of the estimator process
//!
//! The estimator tick reports the outcome of each stage against a fixed
//! [`Component`]. Readiness follows from published ticks: the process is
//! ready once at least one set of estimates is on `/metrics` and nothing is
//! failing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The stages of one estimator tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    PowerSource,
    UtilizationSource,
    Estimator,
}

impl Component {
    pub const ALL: [Component; 3] = [
        Component::PowerSource,
        Component::UtilizationSource,
        Component::Estimator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::PowerSource => "power_source",
            Component::UtilizationSource => "utilization_source",
            Component::Estimator => "estimator",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered by severity, so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but ticks overrun the interval
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds of the last report
    pub updated_at: i64,
}

impl ComponentHealth {
    fn reported(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<Component, ComponentHealth>,
    pub ticks_published: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_published_at: Option<i64>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct HealthState {
    components: BTreeMap<Component, ComponentHealth>,
    ticks_published: u64,
    last_published_at: Option<i64>,
}

/// Shared view of component health, cheap to clone
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// Every component starts healthy; nothing is published yet
    pub fn new() -> Self {
        let components = Component::ALL
            .into_iter()
            .map(|c| (c, ComponentHealth::reported(ComponentStatus::Healthy, None)))
            .collect();
        Self {
            state: Arc::new(RwLock::new(HealthState {
                components,
                ticks_published: 0,
                last_published_at: None,
            })),
        }
    }

    async fn report(&self, component: Component, status: ComponentStatus, message: Option<String>) {
        self.state
            .write()
            .await
            .components
            .insert(component, ComponentHealth::reported(status, message));
    }

    pub async fn mark_healthy(&self, component: Component) {
        self.report(component, ComponentStatus::Healthy, None).await;
    }

    pub async fn mark_degraded(&self, component: Component, message: impl Into<String>) {
        self.report(component, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn mark_failed(&self, component: Component, message: impl Into<String>) {
        self.report(component, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    /// Record that a tick's estimates reached the metrics sink
    pub async fn tick_published(&self) {
        let mut state = self.state.write().await;
        state.ticks_published += 1;
        state.last_published_at = Some(chrono::Utc::now().timestamp());
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        let status = state
            .components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse {
            status,
            components: state.components.clone(),
            ticks_published: state.ticks_published,
            last_published_at: state.last_published_at,
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;

        let failed = state
            .components
            .iter()
            .find(|(_, h)| h.status == ComponentStatus::Unhealthy);

        let reason = if state.ticks_published == 0 {
            Some("No power estimates published yet".to_string())
        } else if let Some((component, health)) = failed {
            Some(format!(
                "{component} unhealthy: {}",
                health.message.as_deref().unwrap_or("no detail")
            ))
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_components_start_healthy() {
        let health = HealthRegistry::new().health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert_eq!(health.components.len(), 3);
        assert_eq!(health.ticks_published, 0);
        assert!(health.last_published_at.is_none());
    }

    #[tokio::test]
    async fn test_overall_status_is_most_severe() {
        let registry = HealthRegistry::new();
        registry
            .mark_degraded(Component::Estimator, "Tick exceeded the estimation interval")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .mark_failed(Component::PowerSource, "BMC unreachable")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);

        registry.mark_healthy(Component::PowerSource).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_readiness_requires_a_published_tick() {
        let registry = HealthRegistry::new();

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("No power estimates published yet")
        );

        registry.tick_published().await;
        let readiness = registry.readiness().await;
        assert!(readiness.ready);
        assert!(readiness.reason.is_none());

        let health = registry.health().await;
        assert_eq!(health.ticks_published, 1);
        assert!(health.last_published_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_component_revokes_readiness() {
        let registry = HealthRegistry::new();
        registry.tick_published().await;
        registry
            .mark_failed(Component::UtilizationSource, "metrics API returned 503")
            .await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("utilization_source unhealthy: metrics API returned 503")
        );
    }

    #[tokio::test]
    async fn test_degraded_component_stays_ready() {
        let registry = HealthRegistry::new();
        registry.tick_published().await;
        registry.mark_degraded(Component::Estimator, "slow").await;

        assert!(registry.readiness().await.ready);
    }

    #[test]
    fn test_components_serialize_by_name() {
        let json = serde_json::to_value(HealthResponse {
            status: ComponentStatus::Healthy,
            components: BTreeMap::from([(
                Component::UtilizationSource,
                ComponentHealth::reported(ComponentStatus::Healthy, None),
            )]),
            ticks_published: 2,
            last_published_at: None,
        })
        .unwrap();

        assert_eq!(json["status"], "healthy");
        assert_eq!(json["components"]["utilization_source"]["status"], "healthy");
        assert!(json.get("last_published_at").is_none());
    }
}
