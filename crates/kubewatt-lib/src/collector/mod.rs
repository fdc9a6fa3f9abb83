//! Telemetry sources
//!
//! Node power comes from a [`PowerSource`] (out-of-band management such as
//! Redfish), container and node CPU utilization from the Kubernetes metrics
//! API. Every source is wrapped in [`Timed`] at construction so collection
//! latency shows up in debug logs.

mod constant;
mod kubernetes;
mod redfish;
mod timed;

pub use constant::ConstantPowerSource;
pub use kubernetes::{parse_cpu_quantity, KubernetesSource, NodeMetrics, PodMetrics};
pub use redfish::{RedfishClient, RedfishPowerSource};
pub use timed::Timed;

use crate::config::{KubeWattConfig, PowerSourceKind};
use crate::error::CollectionError;
use crate::models::{NodePower, PodRef, Snapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub use async_trait::async_trait;

/// Yields instantaneous total power per node
#[async_trait]
pub trait PowerSource: Send + Sync {
    /// Short name of the backing implementation
    fn name(&self) -> &str;

    /// Total power per node in Watts
    async fn power_watts(&self) -> Result<NodePower, CollectionError>;
}

/// Yields per-container CPU utilization
#[async_trait]
pub trait UtilizationSource: Send + Sync {
    /// CPU utilization per container, grouped by node. Every configured node
    /// is present, possibly with no containers.
    async fn container_utilization(&self) -> Result<Snapshot, CollectionError>;
}

/// Cluster inventory and node-level utilization
#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// Every pod in every namespace
    async fn list_pods(&self) -> Result<Vec<PodRef>, CollectionError>;

    /// Node CPU utilization in cores
    async fn node_cpu_utilization(&self) -> Result<HashMap<String, f64>, CollectionError>;

    /// Logical core count per node
    async fn node_cpu_capacity(&self) -> Result<HashMap<String, u32>, CollectionError>;
}

/// Create the power source selected by `collector.power.source`
pub async fn create_power_source(
    config: &KubeWattConfig,
) -> Result<Arc<dyn PowerSource>, CollectionError> {
    let power = &config.collector.power;
    info!(source = ?power.source, "Creating power source");

    let source: Arc<dyn PowerSource> = match power.source {
        PowerSourceKind::Redfish => {
            let inner = RedfishPowerSource::connect(&config.collector.node_names, &power.redfish).await?;
            Arc::new(Timed::new(inner))
        }
        PowerSourceKind::Constant => {
            Arc::new(Timed::new(ConstantPowerSource::new(power.constant.clone())))
        }
    };

    Ok(source)
}

/// Look up a node's value in a per-node response
pub(crate) fn node_value<V: Copy>(
    values: &HashMap<String, V>,
    node: &str,
    what: &'static str,
) -> Result<V, CollectionError> {
    values
        .get(node)
        .copied()
        .ok_or_else(|| CollectionError::MissingNode {
            node: node.to_string(),
            what,
        })
}
