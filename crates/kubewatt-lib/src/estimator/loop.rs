//! Estimator loop
//!
//! Runs one estimation tick per interval until shutdown. A slow tick delays
//! the next one; ticks never overlap.

use super::{ContainerPowerEstimator, ReconcileOutcome, ReconciliationCache};
use crate::error::{CollectionError, EstimatorError};
use crate::health::{Component, HealthRegistry};
use crate::observability::{KubeWattMetrics, MetricsSink, StructuredLogger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct EstimatorLoop {
    estimator: ContainerPowerEstimator,
    cache: ReconciliationCache,
    sink: Arc<dyn MetricsSink>,
    health: HealthRegistry,
    metrics: KubeWattMetrics,
    logger: StructuredLogger,
    interval: Duration,
}

impl EstimatorLoop {
    pub fn new(
        estimator: ContainerPowerEstimator,
        sink: Arc<dyn MetricsSink>,
        health: HealthRegistry,
        metrics: KubeWattMetrics,
        logger: StructuredLogger,
        interval: Duration,
    ) -> Self {
        Self {
            estimator,
            cache: ReconciliationCache::new(),
            sink,
            health,
            metrics,
            logger,
            interval,
        }
    }

    /// Estimate, reconcile and publish once
    pub async fn tick(&mut self) -> Result<ReconcileOutcome, CollectionError> {
        let start = Instant::now();

        let power = self
            .report(Component::PowerSource, self.estimator.sample_power().await)
            .await?;
        let utilization = self
            .report(Component::UtilizationSource, self.estimator.sample_utilization().await)
            .await?;
        let snapshot = self
            .report(Component::Estimator, self.estimator.allocate(&power, &utilization))
            .await?;

        let outcome = self.cache.publish(snapshot, self.sink.as_ref());
        for (node, container) in &outcome.removed {
            self.logger.log_container_removed(node, container);
        }

        let elapsed = start.elapsed();
        self.metrics.observe_tick_duration(elapsed.as_secs_f64());
        self.metrics.set_containers_attributed(outcome.upserted as i64);
        self.metrics.inc_containers_removed(outcome.removed.len() as u64);

        if elapsed > self.interval {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = self.interval.as_millis() as u64,
                "Tick took longer than the interval, next tick is delayed"
            );
            self.health
                .mark_degraded(Component::Estimator, "Tick exceeded the estimation interval")
                .await;
        } else {
            self.health.mark_healthy(Component::Estimator).await;
        }
        self.health.tick_published().await;

        debug!(
            containers = outcome.upserted,
            removed = outcome.removed.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Estimator tick complete"
        );
        Ok(outcome)
    }

    async fn report<T>(
        &self,
        component: Component,
        result: Result<T, CollectionError>,
    ) -> Result<T, CollectionError> {
        match &result {
            Ok(_) => self.health.mark_healthy(component).await,
            Err(e) => self.health.mark_failed(component, e.to_string()).await,
        }
        result
    }

    /// Tick until `shutdown` fires or a tick fails.
    ///
    /// The first tick runs immediately. A tick in progress always completes
    /// before shutdown is observed. Losing every shutdown sender is an error,
    /// since the loop could then never be stopped cleanly.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), EstimatorError> {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting estimator loop"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Estimator tick failed");
                        return Err(e.into());
                    }
                }
                received = shutdown.recv() => match received {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        info!("Shutting down estimator loop");
                        return Ok(());
                    }
                    Err(RecvError::Closed) => {
                        error!("Shutdown channel closed, stopping estimator loop");
                        return Err(EstimatorError::ShutdownChannelClosed);
                    }
                },
            }
        }
    }
}
