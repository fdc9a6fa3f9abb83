//! Error taxonomy shared by every component

use crate::models::PodRef;
use thiserror::Error;

/// Malformed or missing settings; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration failed validation: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("invalid control plane pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A telemetry source could not deliver a complete sample
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected response from {endpoint}: {status}")]
    Status { endpoint: String, status: u16 },

    #[error("Kubernetes API request failed: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("no {what} reported for node '{node}'")]
    MissingNode { node: String, what: &'static str },

    #[error("cluster nodes {cluster:?} do not match configured nodes {configured:?}")]
    NodeMismatch {
        cluster: Vec<String>,
        configured: Vec<String>,
    },

    #[error("invalid quantity '{0}'")]
    Quantity(String),

    #[error("node '{node}' reports zero CPU capacity")]
    ZeroCapacity { node: String },

    #[error("{0}")]
    Source(String),

    #[error("scheduled collection task failed: {0}")]
    Task(String),
}

/// Raw sample persistence failed; never fatal to calibration
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("no storage file open for node '{0}'")]
    UnknownNode(String),

    #[error("failed to build forwarding client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Calibration aborted
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error(
        "found pods that are not part of the control plane; cluster is not empty: {}",
        format_pods(.pods)
    )]
    ClusterNotIdle { pods: Vec<PodRef> },

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error("cannot fit a linear model for node '{node}': {reason}")]
    DegenerateFit { node: String, reason: String },
}

/// The estimator loop stopped without a shutdown request
#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error("shutdown channel closed without a shutdown being sent")]
    ShutdownChannelClosed,
}

fn format_pods(pods: &[PodRef]) -> String {
    pods.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a node's observations did not pass the validity gate.
///
/// Non-fatal: drives another full collection round.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InsufficientData {
    #[error("no observations collected for node '{node}'")]
    Empty { node: String },

    #[error("no observations for node '{node}' fall inside {start}%-{end}%")]
    OutOfRange { node: String, start: u32, end: u32 },

    #[error("node '{node}' has {} under-filled bucket(s), {required} samples required", .buckets.len())]
    SparseBuckets {
        node: String,
        required: usize,
        buckets: Vec<SparseBucket>,
    },
}

/// A bucket holding fewer samples than required
#[derive(Debug, Clone, PartialEq)]
pub struct SparseBucket {
    pub start_percent: u32,
    pub end_percent: u32,
    pub count: usize,
}
