//! Observability infrastructure for KubeWatt
//!
//! Provides:
//! - The exported per-container power gauge and the [`MetricsSink`] writing to it
//! - Process metrics (tick latency, attributed containers, removals)
//! - Structured JSON logging of lifecycle events with tracing

use crate::error::InsufficientData;
use crate::models::{ContainerIdentity, PowerKind};
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_gauge, GaugeVec,
    Histogram, IntCounter, IntGauge,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for tick latency (in seconds); ticks include remote calls
const TICK_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0];

/// Label names of the power gauge, in order
pub const POWER_LABELS: [&str; 5] = ["node", "namespace", "pod", "container", "type"];

static GLOBAL_METRICS: OnceLock<KubeWattMetricsInner> = OnceLock::new();

struct KubeWattMetricsInner {
    container_power_watts: GaugeVec,
    tick_duration_seconds: Histogram,
    containers_attributed: IntGauge,
    containers_removed: IntCounter,
}

impl KubeWattMetricsInner {
    fn new() -> Self {
        Self {
            container_power_watts: register_gauge_vec!(
                "kubewatt_container_power_watts",
                "Power in Watts per Kubernetes workload container",
                &POWER_LABELS
            )
            .expect("Failed to register container_power_watts"),

            tick_duration_seconds: register_histogram!(
                "kubewatt_tick_duration_seconds",
                "Time spent collecting, allocating and publishing one estimator tick",
                TICK_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_duration_seconds"),

            containers_attributed: register_int_gauge!(
                "kubewatt_containers_attributed",
                "Number of workload containers that received power in the last tick"
            )
            .expect("Failed to register containers_attributed"),

            containers_removed: register_int_counter!(
                "kubewatt_containers_removed_total",
                "Total number of container series retired after the container disappeared"
            )
            .expect("Failed to register containers_removed_total"),
        }
    }
}

/// Handle to the process-wide KubeWatt metrics.
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct KubeWattMetrics {
    _private: (),
}

impl Default for KubeWattMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl KubeWattMetrics {
    /// Create a new metrics handle (registers global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(KubeWattMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &KubeWattMetricsInner {
        GLOBAL_METRICS.get_or_init(KubeWattMetricsInner::new)
    }

    pub fn observe_tick_duration(&self, duration_secs: f64) {
        self.inner().tick_duration_seconds.observe(duration_secs);
    }

    pub fn set_containers_attributed(&self, count: i64) {
        self.inner().containers_attributed.set(count);
    }

    pub fn inc_containers_removed(&self, count: u64) {
        self.inner().containers_removed.inc_by(count);
    }

    fn power_gauge(&self) -> &GaugeVec {
        &self.inner().container_power_watts
    }
}

/// Receives allocated power per container series
pub trait MetricsSink: Send + Sync {
    /// Create or overwrite a series
    fn upsert(&self, node: &str, container: &ContainerIdentity, kind: PowerKind, watts: f64);

    /// Retire a series; absent series are ignored
    fn remove(&self, node: &str, container: &ContainerIdentity, kind: PowerKind);
}

/// Writes to the `kubewatt_container_power_watts` gauge served on `/metrics`
#[derive(Clone, Default)]
pub struct PrometheusPowerSink {
    metrics: KubeWattMetrics,
}

impl PrometheusPowerSink {
    pub fn new(metrics: KubeWattMetrics) -> Self {
        Self { metrics }
    }

    /// One `static` series per node, with empty namespace, pod and container
    pub fn publish_static(&self, static_power: &HashMap<String, f64>) {
        let node_level = ContainerIdentity::node_level();
        for (node, watts) in static_power {
            self.upsert(node, &node_level, PowerKind::Static, *watts);
        }
    }

    /// Current value of a series, if it exists
    pub fn value(&self, node: &str, container: &ContainerIdentity, kind: PowerKind) -> Option<f64> {
        let labels = label_values(node, container, kind);
        let families = prometheus::gather();
        let value = families
            .iter()
            .filter(|family| family.get_name() == "kubewatt_container_power_watts")
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                let pairs = metric.get_label();
                POWER_LABELS.iter().zip(labels.iter()).all(|(name, value)| {
                    pairs
                        .iter()
                        .any(|p| p.get_name() == *name && p.get_value() == *value)
                })
            })
            .map(|metric| metric.get_gauge().get_value());
        value
    }
}

fn label_values<'a>(node: &'a str, container: &'a ContainerIdentity, kind: PowerKind) -> [&'a str; 5] {
    [
        node,
        &container.namespace,
        &container.pod_name,
        &container.container_name,
        kind.as_str(),
    ]
}

impl MetricsSink for PrometheusPowerSink {
    fn upsert(&self, node: &str, container: &ContainerIdentity, kind: PowerKind, watts: f64) {
        self.metrics
            .power_gauge()
            .with_label_values(&label_values(node, container, kind))
            .set(watts);
    }

    fn remove(&self, node: &str, container: &ContainerIdentity, kind: PowerKind) {
        // an unknown label set just means there is nothing to retire
        let _ = self
            .metrics
            .power_gauge()
            .remove_label_values(&label_values(node, container, kind));
    }
}

/// Structured logger for KubeWatt lifecycle events
///
/// Emits one JSON line per event with a stable `event` field.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, mode: &str, nodes: usize) {
        info!(
            event = "kubewatt_started",
            instance = %self.instance,
            version = %version,
            mode = %mode,
            nodes = nodes,
            "KubeWatt started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "kubewatt_shutdown",
            instance = %self.instance,
            reason = %reason,
            "KubeWatt shutting down"
        );
    }

    pub fn log_round_started(&self, calibrator: &str, round: u32, window: Duration) {
        info!(
            event = "calibration_round_started",
            instance = %self.instance,
            calibrator = %calibrator,
            round = round,
            window_secs = window.as_secs(),
            "Calibration round started"
        );
    }

    pub fn log_round_rejected(&self, calibrator: &str, round: u32, reason: &InsufficientData) {
        warn!(
            event = "calibration_round_rejected",
            instance = %self.instance,
            calibrator = %calibrator,
            round = round,
            reason = %reason,
            "Collected data is not sufficient, collecting another round"
        );
    }

    pub fn log_calibration_finished(&self, calibrator: &str, static_power: &str) {
        info!(
            event = "calibration_finished",
            instance = %self.instance,
            calibrator = %calibrator,
            static_power = %static_power,
            "Calibration finished"
        );
    }

    pub fn log_container_removed(&self, node: &str, container: &ContainerIdentity) {
        info!(
            event = "container_removed",
            instance = %self.instance,
            node = %node,
            namespace = %container.namespace,
            pod = %container.pod_name,
            container = %container.container_name,
            "Retired power series of terminated container"
        );
    }
}
