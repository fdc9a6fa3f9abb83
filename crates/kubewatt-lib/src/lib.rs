//! KubeWatt library: per-container power attribution for Kubernetes
//!
//! This crate provides the core functionality for:
//! - Power and CPU utilization collection (Redfish, Kubernetes metrics API)
//! - Static power calibration on idle or live clusters
//! - Per-container power estimation with series reconciliation
//! - Raw sample storage
//! - Health checks and observability

pub mod calibration;
pub mod collector;
pub mod config;
pub mod error;
pub mod estimator;
pub mod health;
pub mod models;
pub mod observability;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{KubeWattConfig, Mode};
pub use error::{
    CalibrationError, CollectionError, ConfigError, EstimatorError, InsufficientData, StorageError,
};
pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{KubeWattMetrics, MetricsSink, PrometheusPowerSink, StructuredLogger};
