//! Timing adapter for telemetry sources

use super::{async_trait, ClusterSource, PowerSource, UtilizationSource};
use crate::error::CollectionError;
use crate::models::{NodePower, PodRef, Snapshot};
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// Wraps any source and logs how long each collection took.
///
/// Implements whichever source traits the wrapped type implements.
pub struct Timed<S> {
    inner: S,
}

impl<S> Timed<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: PowerSource> PowerSource for Timed<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn power_watts(&self) -> Result<NodePower, CollectionError> {
        let start = Instant::now();
        let power = self.inner.power_watts().await?;
        debug!(
            source = self.inner.name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            power = ?power,
            "Power collection completed"
        );
        Ok(power)
    }
}

#[async_trait]
impl<S: UtilizationSource> UtilizationSource for Timed<S> {
    async fn container_utilization(&self) -> Result<Snapshot, CollectionError> {
        let start = Instant::now();
        let utilization = self.inner.container_utilization().await?;
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            containers = utilization.values().map(Vec::len).sum::<usize>(),
            "Container utilization collection completed"
        );
        Ok(utilization)
    }
}

#[async_trait]
impl<S: ClusterSource> ClusterSource for Timed<S> {
    async fn list_pods(&self) -> Result<Vec<PodRef>, CollectionError> {
        let start = Instant::now();
        let pods = self.inner.list_pods().await?;
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            pods = pods.len(),
            "Pod listing completed"
        );
        Ok(pods)
    }

    async fn node_cpu_utilization(&self) -> Result<HashMap<String, f64>, CollectionError> {
        let start = Instant::now();
        let utilization = self.inner.node_cpu_utilization().await?;
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            utilization = ?utilization,
            "Node utilization collection completed"
        );
        Ok(utilization)
    }

    async fn node_cpu_capacity(&self) -> Result<HashMap<String, u32>, CollectionError> {
        self.inner.node_cpu_capacity().await
    }
}
