//! Static power from an idle cluster

use super::sampler::{run_staggered, sample_count};
use super::Calibrator;
use crate::collector::{async_trait, node_value, ClusterSource, PowerSource};
use crate::config::ControlPlaneMatcher;
use crate::error::CalibrationError;
use crate::models::{CalibrationResult, NodePower, PodRef};
use crate::observability::StructuredLogger;
use crate::storage::{add_best_effort, close_best_effort, open_best_effort, StorageFactory, StorageSink};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Averages node power over one window on a cluster running nothing but the
/// control plane.
pub struct IdleCalibrator {
    power: Arc<dyn PowerSource>,
    cluster: Arc<dyn ClusterSource>,
    control_plane: ControlPlaneMatcher,
    nodes: Vec<String>,
    window: Duration,
    interval: Duration,
    storage: StorageFactory,
}

impl IdleCalibrator {
    pub fn new(
        power: Arc<dyn PowerSource>,
        cluster: Arc<dyn ClusterSource>,
        control_plane: ControlPlaneMatcher,
        nodes: Vec<String>,
        window: Duration,
        interval: Duration,
        storage: StorageFactory,
    ) -> Self {
        Self {
            power,
            cluster,
            control_plane,
            nodes,
            window,
            interval,
            storage,
        }
    }

    async fn ensure_idle(&self) -> Result<(), CalibrationError> {
        let workload: Vec<PodRef> = self
            .cluster
            .list_pods()
            .await?
            .into_iter()
            .filter(|pod| !self.control_plane.is_control_plane(&pod.name))
            .collect();

        if workload.is_empty() {
            Ok(())
        } else {
            Err(CalibrationError::ClusterNotIdle { pods: workload })
        }
    }

    async fn collect(&self, storage: &mut dyn StorageSink) -> Result<Vec<NodePower>, CalibrationError> {
        let samples = sample_count(self.window, self.interval);
        let nodes = &self.nodes;

        let collected = run_staggered(
            samples,
            self.interval,
            |_| {
                let power = self.power.clone();
                async move { power.power_watts().await }
            },
            |_, sample: &NodePower| {
                for node in nodes {
                    if let Some(watts) = sample.get(node) {
                        add_best_effort(storage, node, &[*watts]);
                    }
                }
            },
        )
        .await?;

        Ok(collected)
    }

    fn mean_power(&self, samples: &[NodePower]) -> Result<BTreeMap<String, f64>, CalibrationError> {
        let mut static_power = BTreeMap::new();
        for node in &self.nodes {
            let mut total = 0.0;
            for sample in samples {
                total += node_value(sample, node, "power")?;
            }
            static_power.insert(node.clone(), total / samples.len().max(1) as f64);
        }
        Ok(static_power)
    }
}

#[async_trait]
impl Calibrator for IdleCalibrator {
    fn name(&self) -> &'static str {
        "idle"
    }

    async fn calibrate(&self, logger: &StructuredLogger) -> Result<CalibrationResult, CalibrationError> {
        self.ensure_idle().await?;

        info!(
            window_secs = self.window.as_secs(),
            "Starting idle power collection, do not run workloads on the cluster"
        );
        logger.log_round_started(self.name(), 1, self.window);

        let mut storage = open_best_effort(&self.storage, self.name(), "power", &["power"]);
        let collected = self.collect(storage.as_mut()).await;
        close_best_effort(storage.as_mut()).await;

        let static_power = self.mean_power(&collected?)?;
        Ok(CalibrationResult { static_power })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataStorageConfig, ForwardConfig, StorageMode};
    use crate::test_support::{FakeCluster, SequencePower};
    use std::collections::HashMap;

    fn matcher() -> ControlPlaneMatcher {
        ControlPlaneMatcher::new(&["kube-.*".to_string(), "etcd-.*".to_string()]).unwrap()
    }

    fn calibrator(power: SequencePower, cluster: FakeCluster) -> IdleCalibrator {
        IdleCalibrator::new(
            Arc::new(power),
            Arc::new(cluster),
            matcher(),
            vec!["n1".into(), "n2".into()],
            Duration::from_millis(20),
            Duration::from_millis(2),
            StorageFactory::disabled(vec!["n1".into(), "n2".into()]),
        )
    }

    #[tokio::test]
    async fn test_constant_power_yields_constant_baseline() {
        let power = SequencePower::constant(&[("n1", 87.3), ("n2", 61.9)]);
        let cluster = FakeCluster::with_pods(&[("kube-system", "kube-proxy-abc"), ("kube-system", "etcd-n1")]);

        let result = calibrator(power, cluster)
            .calibrate(&StructuredLogger::new("test"))
            .await
            .unwrap();

        assert!((result.static_power["n1"] - 87.3).abs() < 1e-9);
        assert!((result.static_power["n2"] - 61.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_baseline_is_mean_of_samples() {
        let power = SequencePower::new(vec![
            HashMap::from([("n1".to_string(), 100.0), ("n2".to_string(), 10.0)]),
            HashMap::from([("n1".to_string(), 110.0), ("n2".to_string(), 20.0)]),
        ]);
        let cluster = FakeCluster::with_pods(&[]);

        let result = calibrator(power, cluster)
            .calibrate(&StructuredLogger::new("test"))
            .await
            .unwrap();

        // ten samples alternating between the two readings
        assert!((result.static_power["n1"] - 105.0).abs() < 1e-9);
        assert!((result.static_power["n2"] - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_workload_pod_aborts_before_sampling() {
        let power = SequencePower::constant(&[("n1", 80.0), ("n2", 60.0)]);
        let calls = power.calls();
        let cluster = FakeCluster::with_pods(&[("kube-system", "kube-proxy-abc"), ("default", "web-0")]);

        let err = calibrator(power, cluster)
            .calibrate(&StructuredLogger::new("test"))
            .await
            .unwrap_err();

        match err {
            CalibrationError::ClusterNotIdle { pods } => {
                assert_eq!(pods.len(), 1);
                assert_eq!(pods[0].to_string(), "default/web-0");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_power_failure_aborts_calibration() {
        let power = SequencePower::failing();
        let cluster = FakeCluster::with_pods(&[]);

        let err = calibrator(power, cluster)
            .calibrate(&StructuredLogger::new("test"))
            .await
            .unwrap_err();
        assert!(matches!(err, CalibrationError::Collection(_)));
    }

    #[tokio::test]
    async fn test_samples_written_to_storage() {
        let dir = tempfile::TempDir::new().unwrap();
        let nodes = vec!["n1".to_string(), "n2".to_string()];
        let storage = StorageFactory::new(
            DataStorageConfig {
                mode: StorageMode::File,
                path: Some(dir.path().to_path_buf()),
                forward: None,
            },
            nodes.clone(),
            5,
        );
        let calibrator = IdleCalibrator::new(
            Arc::new(SequencePower::constant(&[("n1", 90.0), ("n2", 70.0)])),
            Arc::new(FakeCluster::with_pods(&[])),
            matcher(),
            nodes,
            Duration::from_millis(6),
            Duration::from_millis(2),
            storage,
        );

        calibrator.calibrate(&StructuredLogger::new("test")).await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join("5-n1-idle-power.csv")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "power");
        assert_eq!(lines.len(), 4);
        assert!(lines[1..].iter().all(|l| *l == "90"));
    }

    #[tokio::test]
    async fn test_storage_write_failure_is_not_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        // storage only knows n1, so every n2 row is rejected
        let storage = StorageFactory::new(
            DataStorageConfig {
                mode: StorageMode::File,
                path: Some(dir.path().to_path_buf()),
                forward: None,
            },
            vec!["n1".to_string()],
            5,
        );
        let calibrator = IdleCalibrator::new(
            Arc::new(SequencePower::constant(&[("n1", 90.0), ("n2", 70.0)])),
            Arc::new(FakeCluster::with_pods(&[])),
            matcher(),
            vec!["n1".into(), "n2".into()],
            Duration::from_millis(6),
            Duration::from_millis(2),
            storage,
        );

        let result = calibrator.calibrate(&StructuredLogger::new("test")).await.unwrap();

        assert!((result.static_power["n1"] - 90.0).abs() < 1e-9);
        assert!((result.static_power["n2"] - 70.0).abs() < 1e-9);
        assert!(!dir.path().join("5-n2-idle-power.csv").exists());
    }

    #[tokio::test]
    async fn test_storage_closed_when_round_fails() {
        let mut server = mockito::Server::new_async().await;
        // closing a forwarding sink uploads one file per node
        let upload = server
            .mock("POST", "/raw")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let storage = StorageFactory::new(
            DataStorageConfig {
                mode: StorageMode::Forward,
                path: Some(dir.path().to_path_buf()),
                forward: Some(ForwardConfig {
                    url: format!("{}/raw", server.url()),
                    timeout_secs: 5,
                }),
            },
            vec!["n1".to_string(), "n2".to_string()],
            5,
        );
        let calibrator = IdleCalibrator::new(
            Arc::new(SequencePower::failing_after(&[("n1", 90.0), ("n2", 70.0)], 2)),
            Arc::new(FakeCluster::with_pods(&[])),
            matcher(),
            vec!["n1".into(), "n2".into()],
            Duration::from_millis(100),
            Duration::from_millis(10),
            storage,
        );

        let err = calibrator
            .calibrate(&StructuredLogger::new("test"))
            .await
            .unwrap_err();
        assert!(matches!(err, CalibrationError::Collection(_)));

        upload.assert_async().await;
        let contents = std::fs::read_to_string(dir.path().join("5-n1-idle-power.csv")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "power");
        assert!(lines.len() <= 3);
        assert!(lines[1..].iter().all(|l| *l == "90"));
    }
}
