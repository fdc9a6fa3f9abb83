//! Kubernetes inventory and metrics API collection

use super::{async_trait, ClusterSource, UtilizationSource};
use crate::error::CollectionError;
use crate::models::{ContainerIdentity, ContainerValue, PodRef, Snapshot};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta};
use kube::api::{Api, ListParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{error, info};

/// `metrics.k8s.io/v1beta1` per-container usage
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerUsage {
    pub name: String,
    #[serde(default)]
    pub usage: BTreeMap<String, Quantity>,
}

/// `metrics.k8s.io/v1beta1` PodMetrics
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PodMetrics {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerUsage>,
}

impl k8s_openapi::Resource for PodMetrics {
    type Scope = k8s_openapi::NamespaceResourceScope;

    const API_VERSION: &'static str = "metrics.k8s.io/v1beta1";
    const GROUP: &'static str = "metrics.k8s.io";
    const KIND: &'static str = "PodMetrics";
    const URL_PATH_SEGMENT: &'static str = "pods";
    const VERSION: &'static str = "v1beta1";
}

impl k8s_openapi::Metadata for PodMetrics {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &Self::Ty {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Self::Ty {
        &mut self.metadata
    }
}

/// `metrics.k8s.io/v1beta1` NodeMetrics
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeMetrics {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub usage: BTreeMap<String, Quantity>,
}

impl k8s_openapi::Resource for NodeMetrics {
    type Scope = k8s_openapi::ClusterResourceScope;

    const API_VERSION: &'static str = "metrics.k8s.io/v1beta1";
    const GROUP: &'static str = "metrics.k8s.io";
    const KIND: &'static str = "NodeMetrics";
    const URL_PATH_SEGMENT: &'static str = "nodes";
    const VERSION: &'static str = "v1beta1";
}

impl k8s_openapi::Metadata for NodeMetrics {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &Self::Ty {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Self::Ty {
        &mut self.metadata
    }
}

/// Parse a CPU quantity (`250m`, `1`, `12345n`, `3u`) into cores
pub fn parse_cpu_quantity(quantity: &str) -> Result<f64, CollectionError> {
    let quantity = quantity.trim();
    let (number, scale) = match quantity.char_indices().last() {
        Some((i, 'n')) => (&quantity[..i], 1e-9),
        Some((i, 'u')) => (&quantity[..i], 1e-6),
        Some((i, 'm')) => (&quantity[..i], 1e-3),
        Some((i, 'k')) => (&quantity[..i], 1e3),
        Some(_) => (quantity, 1.0),
        None => return Err(CollectionError::Quantity(quantity.to_string())),
    };

    number
        .parse::<f64>()
        .map(|n| n * scale)
        .map_err(|_| CollectionError::Quantity(quantity.to_string()))
}

fn cpu_usage(usage: &BTreeMap<String, Quantity>) -> Result<f64, CollectionError> {
    usage
        .get("cpu")
        .map(|q| parse_cpu_quantity(&q.0))
        .unwrap_or(Ok(0.0))
}

/// Reads pods, pod metrics and node metrics from the Kubernetes API
pub struct KubernetesSource {
    client: Client,
    nodes: Vec<String>,
}

impl KubernetesSource {
    /// Connect using in-cluster configuration or the local kubeconfig
    pub async fn connect(nodes: Vec<String>) -> Result<Self, CollectionError> {
        let client = Client::try_default().await?;
        info!("Successfully initialized Kubernetes client");
        Ok(Self::new(client, nodes))
    }

    pub fn new(client: Client, nodes: Vec<String>) -> Self {
        Self { client, nodes }
    }

    async fn pods(&self) -> Result<Vec<Pod>, CollectionError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

#[async_trait]
impl UtilizationSource for KubernetesSource {
    async fn container_utilization(&self) -> Result<Snapshot, CollectionError> {
        let mut result: Snapshot = self.nodes.iter().map(|n| (n.clone(), Vec::new())).collect();

        // pod metrics carry no node name, so resolve it from the pod spec
        let mut pod_nodes: HashMap<(String, String), String> = HashMap::new();
        for pod in self.pods().await? {
            let node = pod.spec.as_ref().and_then(|s| s.node_name.clone());
            if let (Some(ns), Some(name), Some(node)) =
                (pod.metadata.namespace, pod.metadata.name, node)
            {
                pod_nodes.insert((ns, name), node);
            }
        }

        let api: Api<PodMetrics> = Api::all(self.client.clone());
        for pod in api.list(&ListParams::default()).await?.items {
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            let name = pod.metadata.name.clone().unwrap_or_default();

            let Some(node) = pod_nodes.get(&(namespace.clone(), name.clone())) else {
                error!(namespace = %namespace, pod = %name, "Pod has no node assigned; it will be ignored");
                continue;
            };
            let Some(containers) = result.get_mut(node) else {
                continue;
            };

            for container in &pod.containers {
                containers.push(ContainerValue::new(
                    ContainerIdentity::new(&namespace, &name, &container.name),
                    cpu_usage(&container.usage)?,
                ));
            }
        }

        Ok(result)
    }
}

#[async_trait]
impl ClusterSource for KubernetesSource {
    async fn list_pods(&self) -> Result<Vec<PodRef>, CollectionError> {
        Ok(self
            .pods()
            .await?
            .into_iter()
            .map(|pod| PodRef {
                namespace: pod.metadata.namespace.unwrap_or_default(),
                name: pod.metadata.name.unwrap_or_default(),
            })
            .collect())
    }

    async fn node_cpu_utilization(&self) -> Result<HashMap<String, f64>, CollectionError> {
        let api: Api<NodeMetrics> = Api::all(self.client.clone());
        let metrics = api.list(&ListParams::default()).await?.items;

        let mut result = HashMap::with_capacity(metrics.len());
        for metric in &metrics {
            let name = metric.metadata.name.clone().unwrap_or_default();
            result.insert(name, cpu_usage(&metric.usage)?);
        }

        let reported: HashSet<&String> = result.keys().collect();
        let configured: HashSet<&String> = self.nodes.iter().collect();
        if reported != configured {
            return Err(CollectionError::NodeMismatch {
                cluster: result.keys().cloned().collect(),
                configured: self.nodes.clone(),
            });
        }

        Ok(result)
    }

    async fn node_cpu_capacity(&self) -> Result<HashMap<String, u32>, CollectionError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut result = HashMap::new();
        for node in api.list(&ListParams::default()).await?.items {
            let name = node.metadata.name.unwrap_or_default();
            let cpu = node
                .status
                .and_then(|s| s.capacity)
                .and_then(|c| c.get("cpu").cloned())
                .ok_or_else(|| CollectionError::MissingNode {
                    node: name.clone(),
                    what: "CPU capacity",
                })?;
            result.insert(name, parse_cpu_quantity(&cpu.0)? as u32);
        }
        Ok(result)
    }
}
