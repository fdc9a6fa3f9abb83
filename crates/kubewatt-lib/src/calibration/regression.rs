//! Static power from a live cluster
//!
//! Node CPU and power are sampled together over whole windows until every
//! node's observations pass the [`DataValidityChecker`]. A line is then fit
//! per node and evaluated at the mean control-plane utilization, which is
//! the power of a cluster running only the control plane.

use super::sampler::{run_staggered, sample_count};
use super::validity::DataValidityChecker;
use super::Calibrator;
use crate::collector::{async_trait, node_value, ClusterSource, PowerSource, UtilizationSource};
use crate::config::{ControlPlaneMatcher, RegressionConfig};
use crate::error::{CalibrationError, CollectionError, InsufficientData};
use crate::models::{CalibrationResult, NodePower, ObservationPoint};
use crate::observability::StructuredLogger;
use crate::storage::{add_best_effort, close_best_effort, open_best_effort, StorageFactory, StorageSink};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// `power = intercept + slope * cpu`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub intercept: f64,
    pub slope: f64,
}

impl LinearFit {
    pub fn evaluate(&self, cpu: f64) -> f64 {
        self.intercept + self.slope * cpu
    }
}

/// Weighted least-squares line through the observations.
///
/// `None` when there are no observations or every observation has the
/// same CPU value.
pub fn fit_linear(points: &[ObservationPoint]) -> Option<LinearFit> {
    let mut sum_w = 0.0;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;

    for p in points {
        sum_w += p.weight;
        sum_x += p.weight * p.cpu;
        sum_y += p.weight * p.power;
        sum_xy += p.weight * p.cpu * p.power;
        sum_xx += p.weight * p.cpu * p.cpu;
    }

    let denominator = sum_w * sum_xx - sum_x * sum_x;
    if sum_w <= 0.0 || denominator.abs() < f64::EPSILON {
        return None;
    }

    let slope = (sum_w * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / sum_w;
    Some(LinearFit { intercept, slope })
}

/// One tick of regression data across all nodes
#[derive(Debug, Clone)]
struct RegressionSample {
    node_cpu: HashMap<String, f64>,
    power: NodePower,
    control_plane_cpu: HashMap<String, f64>,
}

/// Observations accumulated across rounds
#[derive(Debug, Default)]
struct Accumulated {
    observations: HashMap<String, Vec<ObservationPoint>>,
    control_plane: HashMap<String, Vec<f64>>,
}

pub struct RegressionCalibrator {
    power: Arc<dyn PowerSource>,
    cluster: Arc<dyn ClusterSource>,
    utilization: Arc<dyn UtilizationSource>,
    control_plane: ControlPlaneMatcher,
    nodes: Vec<String>,
    config: RegressionConfig,
    checker: DataValidityChecker,
    window: Duration,
    interval: Duration,
    storage: StorageFactory,
}

impl RegressionCalibrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        power: Arc<dyn PowerSource>,
        cluster: Arc<dyn ClusterSource>,
        utilization: Arc<dyn UtilizationSource>,
        control_plane: ControlPlaneMatcher,
        nodes: Vec<String>,
        config: RegressionConfig,
        window: Duration,
        interval: Duration,
        storage: StorageFactory,
    ) -> Self {
        let checker = DataValidityChecker::new(&config);
        Self {
            power,
            cluster,
            utilization,
            control_plane,
            nodes,
            config,
            checker,
            window,
            interval,
            storage,
        }
    }

    async fn collect_round(
        &self,
        round: u32,
        utilization_storage: &mut dyn StorageSink,
        control_plane_storage: &mut dyn StorageSink,
    ) -> Result<Vec<RegressionSample>, CalibrationError> {
        let samples = sample_count(self.window, self.interval);
        let nodes = &self.nodes;

        let collected = run_staggered(
            samples,
            self.interval,
            |_| {
                let power = self.power.clone();
                let cluster = self.cluster.clone();
                let utilization = self.utilization.clone();
                let control_plane = self.control_plane.clone();
                let nodes = self.nodes.clone();
                async move {
                    let node_cpu = cluster.node_cpu_utilization().await?;
                    let power = power.power_watts().await?;
                    let containers = utilization.container_utilization().await?;

                    let control_plane_cpu = nodes
                        .iter()
                        .map(|node| {
                            let total = containers
                                .get(node)
                                .map(|cs| {
                                    cs.iter()
                                        .filter(|c| control_plane.is_control_plane(&c.identity.pod_name))
                                        .map(|c| c.value)
                                        .sum()
                                })
                                .unwrap_or(0.0);
                            (node.clone(), total)
                        })
                        .collect();

                    Ok(RegressionSample {
                        node_cpu,
                        power,
                        control_plane_cpu,
                    })
                }
            },
            |_, sample: &RegressionSample| {
                for node in nodes {
                    if let (Some(cpu), Some(watts)) = (sample.node_cpu.get(node), sample.power.get(node)) {
                        add_best_effort(utilization_storage, node, &[*cpu, *watts]);
                    }
                    if let Some(cpu) = sample.control_plane_cpu.get(node) {
                        add_best_effort(control_plane_storage, node, &[*cpu]);
                    }
                }
            },
        )
        .await?;

        debug!(round, samples = collected.len(), "Regression round collected");
        Ok(collected)
    }

    /// Collect one window, keeping raw samples in round-scoped storage
    async fn run_round(&self, round: u32) -> Result<Vec<RegressionSample>, CalibrationError> {
        let mut utilization_storage = open_best_effort(
            &self.storage,
            self.name(),
            &format!("containerUtilization-{round}"),
            &["cpuSeconds", "powerWatts"],
        );
        let mut control_plane_storage = open_best_effort(
            &self.storage,
            self.name(),
            &format!("controlPlaneUtilization-{round}"),
            &["cpuSeconds"],
        );

        let collected = self
            .collect_round(round, utilization_storage.as_mut(), control_plane_storage.as_mut())
            .await;

        close_best_effort(utilization_storage.as_mut()).await;
        close_best_effort(control_plane_storage.as_mut()).await;
        collected
    }

    fn accumulate(
        &self,
        accumulated: &mut Accumulated,
        samples: &[RegressionSample],
    ) -> Result<(), CalibrationError> {
        for sample in samples {
            for node in &self.nodes {
                let cpu = node_value(&sample.node_cpu, node, "CPU utilization")?;
                let power = node_value(&sample.power, node, "power")?;
                let control_plane = node_value(&sample.control_plane_cpu, node, "control plane utilization")?;

                accumulated
                    .observations
                    .entry(node.clone())
                    .or_default()
                    .push(ObservationPoint::new(cpu, power));
                accumulated
                    .control_plane
                    .entry(node.clone())
                    .or_default()
                    .push(control_plane);
            }
        }
        Ok(())
    }

    fn check_validity(
        &self,
        accumulated: &Accumulated,
        cores: &HashMap<String, u32>,
    ) -> Result<Vec<InsufficientData>, CalibrationError> {
        let mut failures = Vec::new();
        for node in &self.nodes {
            let observations = accumulated
                .observations
                .get(node)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let node_cores = node_value(cores, node, "CPU capacity")?;
            if let Err(failure) = self.checker.check(node, observations, node_cores) {
                failures.push(failure);
            }
        }
        Ok(failures)
    }

    fn static_power(
        &self,
        node: &str,
        accumulated: &Accumulated,
        cores: u32,
    ) -> Result<f64, CalibrationError> {
        let mut observations = accumulated
            .observations
            .get(node)
            .cloned()
            .unwrap_or_default();

        if self.config.node_has_smt.get(node).copied().unwrap_or(false) {
            let limit = (cores / 2) as f64;
            info!(node, limit, "Node has SMT enabled, discarding observations above half the logical cores");
            observations.retain(|o| o.cpu <= limit);
        }

        let fit = fit_linear(&observations).ok_or_else(|| CalibrationError::DegenerateFit {
            node: node.to_string(),
            reason: format!(
                "{} observation(s) without spread in CPU utilization",
                observations.len()
            ),
        })?;

        let control_plane = accumulated
            .control_plane
            .get(node)
            .map(|v| mean(v))
            .unwrap_or(0.0);

        let baseline = fit.evaluate(control_plane);
        info!(
            node,
            intercept = fit.intercept,
            slope = fit.slope,
            control_plane_cpu = control_plane,
            static_power = baseline,
            "Fitted power model"
        );
        Ok(baseline)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[async_trait]
impl Calibrator for RegressionCalibrator {
    fn name(&self) -> &'static str {
        "regression"
    }

    async fn calibrate(&self, logger: &StructuredLogger) -> Result<CalibrationResult, CalibrationError> {
        let cores = self.cluster.node_cpu_capacity().await?;
        for node in &self.nodes {
            // no bucket can ever fill on a node without cores
            if node_value(&cores, node, "CPU capacity")? == 0 {
                return Err(CollectionError::ZeroCapacity { node: node.clone() }.into());
            }
        }

        let mut accumulated = Accumulated::default();
        let mut round = 0u32;

        loop {
            round += 1;
            info!(
                round,
                window_secs = self.window.as_secs(),
                "Starting CPU load and power collection, the round repeats until sufficient data has been collected"
            );
            logger.log_round_started(self.name(), round, self.window);

            let samples = self.run_round(round).await?;
            self.accumulate(&mut accumulated, &samples)?;

            let failures = self.check_validity(&accumulated, &cores)?;
            if failures.is_empty() {
                break;
            }
            for failure in &failures {
                logger.log_round_rejected(self.name(), round, failure);
            }
        }

        let mut static_power = BTreeMap::new();
        for node in &self.nodes {
            let node_cores = node_value(&cores, node, "CPU capacity")?;
            static_power.insert(node.clone(), self.static_power(node, &accumulated, node_cores)?);
        }

        Ok(CalibrationResult { static_power })
    }
}
