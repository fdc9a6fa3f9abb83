//! Static power calibration
//!
//! Two strategies produce the per-node baseline the estimator needs:
//! [`IdleCalibrator`] on an empty cluster and [`RegressionCalibrator`] on a
//! live one.

mod idle;
mod regression;
pub mod sampler;
mod validity;

pub use idle::IdleCalibrator;
pub use regression::{fit_linear, LinearFit, RegressionCalibrator};
pub use validity::{ks_statistic, DataValidityChecker};

use crate::collector::{async_trait, ClusterSource, PowerSource, UtilizationSource};
use crate::config::{KubeWattConfig, Mode};
use crate::error::{CalibrationError, ConfigError};
use crate::models::CalibrationResult;
use crate::observability::StructuredLogger;
use crate::storage::StorageFactory;
use std::sync::Arc;

/// Produces a static power baseline for every configured node
#[async_trait]
pub trait Calibrator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run to completion. Blocks for at least one sampling window.
    async fn calibrate(&self, logger: &StructuredLogger) -> Result<CalibrationResult, CalibrationError>;
}

/// Build the calibrator for `mode`, or `None` in estimator mode
pub fn create_calibrator(
    config: &KubeWattConfig,
    power: Arc<dyn PowerSource>,
    cluster: Arc<dyn ClusterSource>,
    utilization: Arc<dyn UtilizationSource>,
    storage: StorageFactory,
) -> Result<Option<Box<dyn Calibrator>>, ConfigError> {
    let nodes = config.collector.node_names.clone();
    let timing = &config.timing;

    let calibrator: Box<dyn Calibrator> = match config.mode {
        Mode::InitBase => Box::new(IdleCalibrator::new(
            power,
            cluster,
            config.control_plane()?,
            nodes,
            timing.idle_window(),
            timing.sample_interval(),
            storage,
        )),
        Mode::InitBootstrap => Box::new(RegressionCalibrator::new(
            power,
            cluster,
            utilization,
            config.control_plane()?,
            nodes,
            config.bootstrap_initializer.clone(),
            timing.regression_window(),
            timing.sample_interval(),
            storage,
        )),
        Mode::Estimator => return Ok(None),
    };

    Ok(Some(calibrator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeCluster, FakeUtilization, SequencePower};

    fn config(mode: &str) -> KubeWattConfig {
        serde_json::from_value(serde_json::json!({
            "mode": mode,
            "collector": {
                "node-names": ["n1"],
                "power": { "source": "constant", "constant": { "n1": 42.0 } },
                "utilization": { "control-plane-pods": ["kube-.*"] }
            }
        }))
        .unwrap()
    }

    fn build(mode: &str) -> Option<Box<dyn Calibrator>> {
        create_calibrator(
            &config(mode),
            Arc::new(SequencePower::constant(&[("n1", 42.0)])),
            Arc::new(FakeCluster::with_pods(&[])),
            Arc::new(FakeUtilization::constant(Default::default())),
            StorageFactory::disabled(vec!["n1".into()]),
        )
        .unwrap()
    }

    #[test]
    fn test_mode_selects_strategy() {
        assert_eq!(build("init-base").unwrap().name(), "idle");
        assert_eq!(build("init-bootstrap").unwrap().name(), "regression");
        assert!(build("estimator").is_none());
    }
}
