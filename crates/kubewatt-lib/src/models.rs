//! Core data models for power attribution

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Instantaneous total power per node, in Watts
pub type NodePower = HashMap<String, f64>;

/// Per-node container values for one tick.
///
/// Used both for raw CPU utilization (CPU-seconds) and for allocated power
/// (Watts). Ordered by node so publication is deterministic.
pub type Snapshot = BTreeMap<String, Vec<ContainerValue>>;

/// Identifies a container within a node.
///
/// The utilization source does not expose container IDs, so the
/// (namespace, pod, container) triple stands in for one. None of the three
/// may contain `/`, which keeps [`ContainerIdentity::key`] unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerIdentity {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
}

impl ContainerIdentity {
    pub fn new(
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
            container_name: container_name.into(),
        }
    }

    /// Identity with every component empty, used for node-level series
    pub fn node_level() -> Self {
        Self::new("", "", "")
    }
}

impl fmt::Display for ContainerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod_name, self.container_name)
    }
}

/// A container identity paired with a scalar value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerValue {
    pub identity: ContainerIdentity,
    pub value: f64,
}

impl ContainerValue {
    pub fn new(identity: ContainerIdentity, value: f64) -> Self {
        Self { identity, value }
    }
}

/// Series type exported next to every power value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerKind {
    Static,
    Dynamic,
}

impl PowerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerKind::Static => "static",
            PowerKind::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for PowerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A weighted (cpu, power) pair used for regression fitting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservationPoint {
    /// Node CPU utilization in cores
    pub cpu: f64,
    /// Node power in Watts
    pub power: f64,
    pub weight: f64,
}

impl ObservationPoint {
    pub fn new(cpu: f64, power: f64) -> Self {
        Self {
            cpu,
            power,
            weight: 1.0,
        }
    }
}

/// A pod as seen by the cluster inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Output of a calibration run.
///
/// Serializes to the same shape accepted by `collector.node-static-power`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub static_power: BTreeMap<String, f64>,
}
