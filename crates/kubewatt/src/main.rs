//! KubeWatt - per-container power estimation for Kubernetes
//!
//! One binary, three modes: `init-base` and `init-bootstrap` compute a
//! static power baseline per node and exit; `estimator` attributes dynamic
//! node power to containers and exports it over Prometheus until stopped.

use anyhow::{Context, Result};
use clap::Parser;
use kubewatt::api;
use kubewatt_lib::{
    calibration::create_calibrator,
    collector::{
        create_power_source, ClusterSource, KubernetesSource, PowerSource, Timed, UtilizationSource,
    },
    estimator::{ContainerPowerEstimator, EstimatorLoop},
    storage::StorageFactory,
    HealthRegistry, KubeWattConfig, KubeWattMetrics, Mode, PrometheusPowerSink, StructuredLogger,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const KUBEWATT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "kubewatt")]
#[command(author, version, about = "Per-container power estimation for Kubernetes", long_about = None)]
struct Args {
    /// Configuration file (JSON or YAML)
    #[arg(long, short, env = "KW_CONFIG_PATH", default_value = "config.json")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "KW_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(fmt::layer().json())
        .init();

    let config = KubeWattConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let started_at = chrono::Utc::now().timestamp();
    let nodes = config.collector.node_names.clone();

    let logger = StructuredLogger::new("kubewatt");
    logger.log_startup(KUBEWATT_VERSION, &config.mode.to_string(), nodes.len());

    let power = create_power_source(&config).await?;
    let kubernetes = Arc::new(Timed::new(KubernetesSource::connect(nodes.clone()).await?));
    let cluster: Arc<dyn ClusterSource> = kubernetes.clone();
    let utilization: Arc<dyn UtilizationSource> = kubernetes;

    match config.mode {
        Mode::InitBase | Mode::InitBootstrap => {
            let storage = StorageFactory::new(config.data_storage.clone(), nodes, started_at);
            calibrate(&config, &logger, power, cluster, utilization, storage).await
        }
        Mode::Estimator => estimate(&config, &logger, power, utilization).await,
    }
}

async fn calibrate(
    config: &KubeWattConfig,
    logger: &StructuredLogger,
    power: Arc<dyn PowerSource>,
    cluster: Arc<dyn ClusterSource>,
    utilization: Arc<dyn UtilizationSource>,
    storage: StorageFactory,
) -> Result<()> {
    let Some(calibrator) = create_calibrator(config, power, cluster, utilization, storage)? else {
        return Ok(());
    };

    let result = calibrator.calibrate(logger).await?;
    logger.log_calibration_finished(calibrator.name(), &serde_json::to_string(&result.static_power)?);

    if let Some(path) = &config.calibration_output {
        let json = serde_json::to_string_pretty(&result.static_power)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("writing calibration result to {}", path.display()))?;
        info!(path = %path.display(), "Wrote calibration result");
    }

    logger.log_shutdown("calibration complete");
    Ok(())
}

async fn estimate(
    config: &KubeWattConfig,
    logger: &StructuredLogger,
    power: Arc<dyn PowerSource>,
    utilization: Arc<dyn UtilizationSource>,
) -> Result<()> {
    let static_power = config
        .static_power()
        .cloned()
        .context("collector.node-static-power is required in estimator mode")?;

    let health_registry = HealthRegistry::new();

    let metrics = KubeWattMetrics::new();
    let sink = PrometheusPowerSink::new(metrics.clone());
    sink.publish_static(&static_power);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    let api_handle = tokio::spawn(api::serve(config.server.port, app_state));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let estimator = ContainerPowerEstimator::new(
        power,
        utilization,
        static_power,
        config.control_plane()?,
        config.collector.node_names.clone(),
    );
    let estimator_loop = EstimatorLoop::new(
        estimator,
        Arc::new(sink),
        health_registry,
        metrics,
        logger.clone(),
        config.timing.estimator_interval(),
    );

    let mut estimator_task = tokio::spawn(estimator_loop.run(shutdown_rx));

    let joined = tokio::select! {
        joined = &mut estimator_task => joined,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
                estimator_task.abort();
                api_handle.abort();
                logger.log_shutdown("signal listener failed");
                return Err(e).context("listening for SIGINT");
            }
            info!("SIGINT received, waiting for the current tick");
            // fails only if the loop already returned
            let _ = shutdown_tx.send(());
            estimator_task.await
        }
    };
    api_handle.abort();

    match joined.context("estimator task panicked")? {
        Ok(()) => {
            logger.log_shutdown("SIGINT received");
            Ok(())
        }
        Err(e) => {
            logger.log_shutdown("estimation failed");
            Err(e.into())
        }
    }
}
