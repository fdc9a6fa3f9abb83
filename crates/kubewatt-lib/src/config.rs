//! KubeWatt configuration
//!
//! One immutable [`KubeWattConfig`] is built at startup and handed to every
//! component. Keys are kebab-case; the file may be JSON or YAML and any
//! top-level key can be overridden from the environment with the `KW`
//! prefix, e.g. `KW__MODE=estimator`.

use crate::error::ConfigError;
use regex::RegexSet;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

/// Process mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Idle calibration on an empty cluster
    InitBase,
    /// Regression calibration on a live cluster
    InitBootstrap,
    /// Continuous per-container estimation
    Estimator,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::InitBase => write!(f, "init-base"),
            Mode::InitBootstrap => write!(f, "init-bootstrap"),
            Mode::Estimator => write!(f, "estimator"),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KubeWattConfig {
    pub mode: Mode,

    pub collector: CollectorConfig,

    #[serde(default)]
    pub data_storage: DataStorageConfig,

    #[serde(default)]
    pub bootstrap_initializer: RegressionConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Where to write the calibration result, if anywhere
    #[serde(default)]
    pub calibration_output: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CollectorConfig {
    pub node_names: Vec<String>,

    pub power: PowerConfig,

    pub utilization: UtilizationConfig,

    /// Static baseline per node, produced by calibration
    #[serde(default)]
    pub node_static_power: Option<HashMap<String, f64>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PowerConfig {
    pub source: PowerSourceKind,

    #[serde(default)]
    pub redfish: HashMap<String, RedfishConfig>,

    #[serde(default)]
    pub constant: HashMap<String, f64>,
}

/// Where node power comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerSourceKind {
    Redfish,
    /// Fixed per-node values, for dry runs
    Constant,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RedfishConfig {
    pub host: String,
    pub systems: Vec<String>,
    pub username: String,
    pub password: String,
    /// BMCs rarely carry signed certificates
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UtilizationConfig {
    /// Regexes matched against the full pod name
    pub control_plane_pods: Vec<String>,
}

/// Bucket parameters for the regression validity gate
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegressionConfig {
    #[serde(default = "default_bucket_start")]
    pub bucket_percent_start: u32,

    #[serde(default = "default_bucket_end")]
    pub bucket_percent_end: u32,

    #[serde(default = "default_bucket_size")]
    pub bucket_size: u32,

    #[serde(default = "default_min_mult")]
    pub min_mult: f64,

    #[serde(default)]
    pub node_has_smt: HashMap<String, bool>,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            bucket_percent_start: default_bucket_start(),
            bucket_percent_end: default_bucket_end(),
            bucket_size: default_bucket_size(),
            min_mult: default_min_mult(),
            node_has_smt: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TimingConfig {
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    #[serde(default = "default_idle_window")]
    pub idle_window_secs: u64,

    #[serde(default = "default_regression_window")]
    pub regression_window_secs: u64,

    #[serde(default = "default_estimator_interval")]
    pub estimator_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval(),
            idle_window_secs: default_idle_window(),
            regression_window_secs: default_regression_window(),
            estimator_interval_secs: default_estimator_interval(),
        }
    }
}

impl TimingConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_secs(self.idle_window_secs)
    }

    pub fn regression_window(&self) -> Duration {
        Duration::from_secs(self.regression_window_secs)
    }

    pub fn estimator_interval(&self) -> Duration {
        Duration::from_secs(self.estimator_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataStorageConfig {
    #[serde(default)]
    pub mode: StorageMode,

    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub forward: Option<ForwardConfig>,
}

impl DataStorageConfig {
    pub fn directory(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new("."))
    }
}

/// How raw calibration samples are persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[default]
    None,
    File,
    /// Write files, then POST them to `forward.url` on close
    Forward,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ForwardConfig {
    pub url: String,

    #[serde(default = "default_forward_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bucket_start() -> u32 {
    20
}

fn default_bucket_end() -> u32 {
    80
}

fn default_bucket_size() -> u32 {
    10
}

fn default_min_mult() -> f64 {
    0.5
}

fn default_sample_interval() -> u64 {
    15
}

fn default_idle_window() -> u64 {
    5 * 60
}

fn default_regression_window() -> u64 {
    30 * 60
}

fn default_estimator_interval() -> u64 {
    15
}

fn default_forward_timeout() -> u64 {
    30
}

fn default_server_port() -> u16 {
    9400
}

impl KubeWattConfig {
    /// Load configuration from a file layered with `KW`-prefixed environment
    /// variables, then validate it
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("KW")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: KubeWattConfig = settings.try_deserialize()?;
        config.validate()?;
        info!(path = %path.display(), mode = %config.mode, "Loaded configuration");
        Ok(config)
    }

    /// Check every cross-field constraint, reporting all violations at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();
        let nodes: HashSet<&str> = self.collector.node_names.iter().map(String::as_str).collect();

        if self.collector.node_names.is_empty() {
            violations.push("collector.node-names must not be empty".to_string());
        }
        if self.collector.node_names.iter().any(|n| n.trim().is_empty()) {
            violations.push("collector.node-names must not contain blank names".to_string());
        }
        if nodes.len() != self.collector.node_names.len() {
            violations.push("collector.node-names must not contain duplicates".to_string());
        }

        match self.collector.power.source {
            PowerSourceKind::Redfish => {
                if !same_keys(&self.collector.power.redfish, &nodes) {
                    violations.push(
                        "collector.power.redfish must contain the same keys as collector.node-names"
                            .to_string(),
                    );
                }
                for (node, redfish) in &self.collector.power.redfish {
                    if url::Url::parse(&redfish.host).is_err() {
                        violations.push(format!("collector.power.redfish.{node}.host must be a URL"));
                    }
                    if redfish.systems.is_empty() || redfish.systems.iter().any(|s| s.trim().is_empty()) {
                        violations.push(format!(
                            "collector.power.redfish.{node}.systems must be non-empty and contain no blanks"
                        ));
                    }
                    if redfish.username.trim().is_empty() || redfish.password.trim().is_empty() {
                        violations.push(format!(
                            "collector.power.redfish.{node} requires username and password"
                        ));
                    }
                }
            }
            PowerSourceKind::Constant => {
                if !same_keys(&self.collector.power.constant, &nodes) {
                    violations.push(
                        "collector.power.constant must contain the same keys as collector.node-names"
                            .to_string(),
                    );
                }
            }
        }

        let patterns = &self.collector.utilization.control_plane_pods;
        if patterns.is_empty() || patterns.iter().any(|p| p.trim().is_empty()) {
            violations.push(
                "collector.utilization.control-plane-pods must be non-empty and contain no blanks"
                    .to_string(),
            );
        }
        if let Err(e) = ControlPlaneMatcher::new(patterns) {
            violations.push(e.to_string());
        }

        match &self.collector.node_static_power {
            None if self.mode == Mode::Estimator => violations.push(
                "collector.node-static-power cannot be empty when mode is estimator".to_string(),
            ),
            Some(static_power) if !same_keys(static_power, &nodes) => violations.push(
                "collector.node-static-power must contain the same keys as collector.node-names"
                    .to_string(),
            ),
            _ => {}
        }

        let regression = &self.bootstrap_initializer;
        if regression.bucket_percent_start > 100
            || regression.bucket_percent_end > 100
            || regression.bucket_size > 100
        {
            violations.push("bootstrap-initializer bucket percentages must be within 0..=100".to_string());
        }
        if regression.bucket_percent_start >= regression.bucket_percent_end {
            violations.push(
                "bootstrap-initializer.bucket-percent-start must be below bucket-percent-end".to_string(),
            );
        }
        if regression.bucket_size == 0 {
            violations.push("bootstrap-initializer.bucket-size must be positive".to_string());
        } else if regression.bucket_percent_end > regression.bucket_percent_start
            && (regression.bucket_percent_end - regression.bucket_percent_start) % regression.bucket_size != 0
        {
            violations.push(
                "bootstrap-initializer bucket range must be divisible by bucket-size".to_string(),
            );
        }
        if !(0.0..=1.0).contains(&regression.min_mult) {
            violations.push("bootstrap-initializer.min-mult must be within 0..=1".to_string());
        }
        if self.mode == Mode::InitBootstrap && !same_keys(&regression.node_has_smt, &nodes) {
            violations.push(
                "bootstrap-initializer.node-has-smt must contain the same keys as collector.node-names"
                    .to_string(),
            );
        }

        let timing = &self.timing;
        if timing.sample_interval_secs == 0 || timing.estimator_interval_secs == 0 {
            violations.push("timing intervals must be positive".to_string());
        }
        if timing.idle_window_secs < timing.sample_interval_secs
            || timing.regression_window_secs < timing.sample_interval_secs
        {
            violations.push("timing windows must hold at least one sample interval".to_string());
        }

        if self.data_storage.mode == StorageMode::Forward {
            match &self.data_storage.forward {
                Some(forward) if url::Url::parse(&forward.url).is_err() => {
                    violations.push("data-storage.forward.url must be a URL".to_string())
                }
                None => violations
                    .push("data-storage.forward is required when mode is forward".to_string()),
                _ => {}
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            for violation in &violations {
                error!(violation = %violation, "Config validation violation");
            }
            Err(ConfigError::Invalid(violations))
        }
    }

    /// Static baseline per configured node
    pub fn static_power(&self) -> Option<&HashMap<String, f64>> {
        self.collector.node_static_power.as_ref()
    }

    pub fn control_plane(&self) -> Result<ControlPlaneMatcher, ConfigError> {
        ControlPlaneMatcher::new(&self.collector.utilization.control_plane_pods)
    }
}

fn same_keys<V>(map: &HashMap<String, V>, nodes: &HashSet<&str>) -> bool {
    map.len() == nodes.len() && map.keys().all(|k| nodes.contains(k.as_str()))
}

/// Matches pod names against the control-plane allow-list.
///
/// Each pattern must match the whole pod name.
#[derive(Debug, Clone)]
pub struct ControlPlaneMatcher {
    patterns: RegexSet,
}

impl ControlPlaneMatcher {
    pub fn new(patterns: &[String]) -> Result<Self, ConfigError> {
        for pattern in patterns {
            regex::Regex::new(pattern).map_err(|source| ConfigError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
        }

        let anchored = patterns.iter().map(|p| format!("^(?:{p})$"));
        let patterns = RegexSet::new(anchored).map_err(|source| ConfigError::Pattern {
            pattern: patterns.join(", "),
            source,
        })?;
        Ok(Self { patterns })
    }

    pub fn is_control_plane(&self, pod_name: &str) -> bool {
        self.patterns.is_match(pod_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator_json() -> serde_json::Value {
        serde_json::json!({
            "mode": "estimator",
            "collector": {
                "node-names": ["n1", "n2"],
                "power": {
                    "source": "constant",
                    "constant": { "n1": 120.0, "n2": 80.0 }
                },
                "utilization": {
                    "control-plane-pods": ["kube-.*", "etcd-.*", "coredns-.*"]
                },
                "node-static-power": { "n1": 50.0, "n2": 40.0 }
            }
        })
    }

    fn parse(value: serde_json::Value) -> KubeWattConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(estimator_json());
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.sample_interval(), Duration::from_secs(15));
        assert_eq!(config.timing.idle_window(), Duration::from_secs(300));
        assert_eq!(config.timing.regression_window(), Duration::from_secs(1800));
        assert_eq!(config.server.port, 9400);
        assert_eq!(config.data_storage.mode, StorageMode::None);
        assert_eq!(config.data_storage.directory(), Path::new("."));
        assert_eq!(config.bootstrap_initializer.bucket_percent_start, 20);
        assert_eq!(config.bootstrap_initializer.bucket_percent_end, 80);
    }

    #[test]
    fn test_estimator_requires_static_power() {
        let mut json = estimator_json();
        json["collector"]
            .as_object_mut()
            .unwrap()
            .remove("node-static-power");
        let err = parse(json).validate().unwrap_err();
        assert!(err.to_string().contains("node-static-power"));
    }

    #[test]
    fn test_static_power_keys_must_match_nodes() {
        let mut json = estimator_json();
        json["collector"]["node-static-power"] = serde_json::json!({ "n1": 50.0 });
        assert!(parse(json).validate().is_err());
    }

    #[test]
    fn test_unknown_power_source_rejected_at_parse() {
        let mut json = estimator_json();
        json["collector"]["power"]["source"] = serde_json::json!("ipmi");
        assert!(serde_json::from_value::<KubeWattConfig>(json).is_err());
    }

    #[test]
    fn test_redfish_requires_node_entries() {
        let mut json = estimator_json();
        json["collector"]["power"] = serde_json::json!({
            "source": "redfish",
            "redfish": {
                "n1": {
                    "host": "https://bmc-1.local",
                    "systems": ["1"],
                    "username": "root",
                    "password": "secret"
                }
            }
        });
        let err = parse(json).validate().unwrap_err();
        assert!(err.to_string().contains("collector.power.redfish"));
    }

    #[test]
    fn test_bootstrap_requires_smt_flags() {
        let mut json = estimator_json();
        json["mode"] = serde_json::json!("init-bootstrap");
        assert!(parse(json.clone()).validate().is_err());

        json["bootstrap-initializer"] = serde_json::json!({
            "node-has-smt": { "n1": true, "n2": false }
        });
        assert!(parse(json).validate().is_ok());
    }

    #[test]
    fn test_bucket_parameters_validated() {
        let mut json = estimator_json();
        json["bootstrap-initializer"] = serde_json::json!({
            "bucket-percent-start": 80,
            "bucket-percent-end": 20,
            "bucket-size": 0,
            "min-mult": 1.5
        });
        let err = parse(json).validate().unwrap_err();
        match err {
            ConfigError::Invalid(violations) => assert!(violations.len() >= 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut json = estimator_json();
        json["collector"]["utilization"]["control-plane-pods"] = serde_json::json!(["kube-("]);
        assert!(parse(json).validate().is_err());
    }

    #[test]
    fn test_forward_requires_url() {
        let mut json = estimator_json();
        json["data-storage"] = serde_json::json!({ "mode": "forward" });
        assert!(parse(json).validate().is_err());
    }

    #[test]
    fn test_control_plane_matches_whole_name() {
        let matcher = ControlPlaneMatcher::new(&["kube-proxy-.*".to_string(), "etcd".to_string()]).unwrap();
        assert!(matcher.is_control_plane("kube-proxy-x7k2p"));
        assert!(matcher.is_control_plane("etcd"));
        assert!(!matcher.is_control_plane("etcd-node1"));
        assert!(!matcher.is_control_plane("my-kube-proxy-x7k2p"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, estimator_json().to_string()).unwrap();

        let config = KubeWattConfig::load(&path).unwrap();
        assert_eq!(config.mode, Mode::Estimator);
        assert_eq!(config.collector.node_names, vec!["n1", "n2"]);
        assert_eq!(config.static_power().unwrap()["n1"], 50.0);
    }
}
