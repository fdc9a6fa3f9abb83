//! In-memory sources and sinks for unit tests

use crate::collector::{async_trait, ClusterSource, PowerSource, UtilizationSource};
use crate::error::CollectionError;
use crate::models::{ContainerIdentity, NodePower, PodRef, PowerKind, Snapshot};
use crate::observability::MetricsSink;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Cycles through fixed readings, one per call
pub struct SequencePower {
    readings: Vec<NodePower>,
    fail_from: Option<usize>,
    calls: Arc<AtomicUsize>,
}

impl SequencePower {
    pub fn new(readings: Vec<NodePower>) -> Self {
        Self {
            readings,
            fail_from: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answers `succeed` calls with `watts`, then fails every call
    pub fn failing_after(watts: &[(&str, f64)], succeed: usize) -> Self {
        Self {
            fail_from: Some(succeed),
            ..Self::constant(watts)
        }
    }

    pub fn constant(watts: &[(&str, f64)]) -> Self {
        Self::new(vec![watts.iter().map(|(n, w)| (n.to_string(), *w)).collect()])
    }

    /// Every call fails
    pub fn failing() -> Self {
        Self::new(Vec::new())
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl PowerSource for SequencePower {
    fn name(&self) -> &str {
        "sequence"
    }

    async fn power_watts(&self) -> Result<NodePower, CollectionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.readings.is_empty() || self.fail_from.is_some_and(|n| call >= n) {
            return Err(CollectionError::Source("power source unavailable".into()));
        }
        Ok(self.readings[call % self.readings.len()].clone())
    }
}

/// Returns snapshots in order, repeating the last one
pub struct FakeUtilization {
    snapshots: Vec<Snapshot>,
    calls: AtomicUsize,
}

impl FakeUtilization {
    pub fn constant(snapshot: Snapshot) -> Self {
        Self::sequence(vec![snapshot])
    }

    pub fn sequence(snapshots: Vec<Snapshot>) -> Self {
        Self {
            snapshots,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl UtilizationSource for FakeUtilization {
    async fn container_utilization(&self) -> Result<Snapshot, CollectionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = call.min(self.snapshots.len().saturating_sub(1));
        Ok(self.snapshots.get(index).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeCluster {
    pods: Vec<PodRef>,
    cores: HashMap<String, u32>,
    node_cpu: Vec<HashMap<String, f64>>,
    node_cpu_calls: Arc<AtomicUsize>,
}

impl FakeCluster {
    pub fn with_pods(pods: &[(&str, &str)]) -> Self {
        Self {
            pods: pods
                .iter()
                .map(|(ns, name)| PodRef {
                    namespace: ns.to_string(),
                    name: name.to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn cores(mut self, cores: &[(&str, u32)]) -> Self {
        self.cores = cores.iter().map(|(n, c)| (n.to_string(), *c)).collect();
        self
    }

    /// Node CPU readings, cycled one per call
    pub fn node_cpu_sequence(mut self, readings: Vec<HashMap<String, f64>>) -> Self {
        self.node_cpu = readings;
        self
    }

    pub fn node_cpu_calls(&self) -> Arc<AtomicUsize> {
        self.node_cpu_calls.clone()
    }
}

#[async_trait]
impl ClusterSource for FakeCluster {
    async fn list_pods(&self) -> Result<Vec<PodRef>, CollectionError> {
        Ok(self.pods.clone())
    }

    async fn node_cpu_utilization(&self) -> Result<HashMap<String, f64>, CollectionError> {
        let call = self.node_cpu_calls.fetch_add(1, Ordering::SeqCst);
        if self.node_cpu.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(self.node_cpu[call % self.node_cpu.len()].clone())
    }

    async fn node_cpu_capacity(&self) -> Result<HashMap<String, u32>, CollectionError> {
        Ok(self.cores.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Upsert(String, ContainerIdentity, PowerKind, f64),
    Remove(String, ContainerIdentity, PowerKind),
}

/// Records every call in order
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn upserts(&self) -> Vec<SinkCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, SinkCall::Upsert(..)))
            .collect()
    }

    pub fn removes(&self) -> Vec<SinkCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, SinkCall::Remove(..)))
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl MetricsSink for RecordingSink {
    fn upsert(&self, node: &str, container: &ContainerIdentity, kind: PowerKind, watts: f64) {
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Upsert(node.to_string(), container.clone(), kind, watts));
    }

    fn remove(&self, node: &str, container: &ContainerIdentity, kind: PowerKind) {
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Remove(node.to_string(), container.clone(), kind));
    }
}
