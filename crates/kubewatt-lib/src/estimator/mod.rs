//! Per-container power estimation
//!
//! Each tick, node power above the static baseline is split across the
//! node's workload containers in proportion to their CPU utilization.
//! Control-plane containers are left out; their cost is part of the
//! baseline.

mod r#loop;
mod reconcile;

pub use r#loop::EstimatorLoop;
pub use reconcile::{ReconcileOutcome, ReconciliationCache};

use crate::collector::{node_value, PowerSource, UtilizationSource};
use crate::config::ControlPlaneMatcher;
use crate::error::CollectionError;
use crate::models::{ContainerValue, NodePower, Snapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Result of splitting one node's power
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub static_power: f64,
    pub dynamic_power: f64,
    /// Allocated Watts per workload container
    pub containers: Vec<ContainerValue>,
}

/// Split `node_power` for one node.
///
/// Dynamic power never goes negative: a baseline above the measured power
/// is clamped to it. With zero workload CPU every container gets 0 W.
pub fn allocate_node(
    node_power: f64,
    static_baseline: f64,
    utilization: &[ContainerValue],
    control_plane: &ControlPlaneMatcher,
) -> Allocation {
    let static_power = static_baseline.min(node_power);
    let dynamic_power = node_power - static_power;

    let workload: Vec<&ContainerValue> = utilization
        .iter()
        .filter(|c| !control_plane.is_control_plane(&c.identity.pod_name))
        .collect();
    let cpu_total: f64 = workload.iter().map(|c| c.value).sum();

    let containers = workload
        .into_iter()
        .map(|c| {
            let watts = if cpu_total == 0.0 {
                0.0
            } else {
                c.value / cpu_total * dynamic_power
            };
            ContainerValue::new(c.identity.clone(), watts)
        })
        .collect();

    Allocation {
        static_power,
        dynamic_power,
        containers,
    }
}

/// Pulls power and utilization and allocates every configured node
pub struct ContainerPowerEstimator {
    power: Arc<dyn PowerSource>,
    utilization: Arc<dyn UtilizationSource>,
    static_power: HashMap<String, f64>,
    control_plane: ControlPlaneMatcher,
    nodes: Vec<String>,
}

impl ContainerPowerEstimator {
    pub fn new(
        power: Arc<dyn PowerSource>,
        utilization: Arc<dyn UtilizationSource>,
        static_power: HashMap<String, f64>,
        control_plane: ControlPlaneMatcher,
        nodes: Vec<String>,
    ) -> Self {
        Self {
            power,
            utilization,
            static_power,
            control_plane,
            nodes,
        }
    }

    /// Allocated Watts per container, grouped by node. Every configured node
    /// is present.
    pub async fn estimate(&self) -> Result<Snapshot, CollectionError> {
        let power = self.sample_power().await?;
        let utilization = self.sample_utilization().await?;
        self.allocate(&power, &utilization)
    }

    pub async fn sample_power(&self) -> Result<NodePower, CollectionError> {
        self.power.power_watts().await
    }

    pub async fn sample_utilization(&self) -> Result<Snapshot, CollectionError> {
        self.utilization.container_utilization().await
    }

    /// Split already collected samples. Fails if a configured node has no
    /// power reading or no baseline.
    pub fn allocate(&self, power: &NodePower, utilization: &Snapshot) -> Result<Snapshot, CollectionError> {
        let mut result = Snapshot::new();
        for node in &self.nodes {
            let node_power = node_value(power, node, "power")?;
            let baseline = node_value(&self.static_power, node, "static power")?;
            let containers = utilization.get(node).map(Vec::as_slice).unwrap_or(&[]);

            let allocation = allocate_node(node_power, baseline, containers, &self.control_plane);
            debug!(
                node = %node,
                node_power,
                static_power = allocation.static_power,
                dynamic_power = allocation.dynamic_power,
                containers = allocation.containers.len(),
                "Allocated node power"
            );
            result.insert(node.clone(), allocation.containers);
        }

        Ok(result)
    }
}
