//! Redfish power collection
//!
//! Each node's BMC exposes one or more systems; node power is the sum of
//! `PowerConsumedWatts` over the configured systems.

use super::{async_trait, PowerSource};
use crate::config::RedfishConfig;
use crate::error::CollectionError;
use crate::models::NodePower;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct SystemCollection {
    #[serde(rename = "Members", default)]
    members: Vec<SystemMember>,
}

#[derive(Debug, Deserialize)]
struct SystemMember {
    #[serde(rename = "@odata.id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct PowerControl {
    #[serde(rename = "PowerConsumedWatts")]
    power_consumed_watts: f64,
}

/// Client for a single node's BMC
pub struct RedfishClient {
    host: String,
    username: String,
    password: String,
    systems: Vec<String>,
    client: reqwest::Client,
}

impl RedfishClient {
    /// Connect to the BMC and verify every configured system exists.
    ///
    /// The system list is read once; a change on the BMC side requires a
    /// restart.
    pub async fn connect(config: &RedfishConfig) -> Result<Self, CollectionError> {
        let host = config.host.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| CollectionError::Http {
                endpoint: host.clone(),
                source,
            })?;

        let redfish = Self {
            host,
            username: config.username.clone(),
            password: config.password.clone(),
            systems: config.systems.clone(),
            client,
        };
        redfish.verify_systems().await?;
        Ok(redfish)
    }

    async fn verify_systems(&self) -> Result<(), CollectionError> {
        let collection: SystemCollection = self.get_json("/redfish/v1/Systems").await?;
        let found: Vec<String> = collection
            .members
            .iter()
            .filter_map(|m| m.id.trim_end_matches('/').rsplit('/').next())
            .map(str::to_string)
            .collect();

        let missing: Vec<&String> = self.systems.iter().filter(|s| !found.contains(s)).collect();
        if !missing.is_empty() {
            return Err(CollectionError::Source(format!(
                "not all systems in config were found in Redfish at {}. Config: {:?}, Redfish: {:?}",
                self.host, self.systems, found
            )));
        }

        debug!(host = %self.host, systems = ?found, "Redfish systems verified");
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, CollectionError> {
        let endpoint = format!("{}{}", self.host, path);
        let response = self
            .client
            .get(&endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|source| CollectionError::Http {
                endpoint: endpoint.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CollectionError::Status {
                endpoint,
                status: response.status().as_u16(),
            });
        }

        response
            .json()
            .await
            .map_err(|source| CollectionError::Http { endpoint, source })
    }

    /// Sum of consumed power over all configured systems
    pub async fn total_power_watts(&self) -> Result<f64, CollectionError> {
        let mut total = 0.0;
        for system in &self.systems {
            let path = format!("/redfish/v1/Chassis/{system}/Power/PowerControl");
            let control: PowerControl = self.get_json(&path).await?;
            total += control.power_consumed_watts;
        }
        Ok(total)
    }
}

/// Power source backed by one Redfish client per node
pub struct RedfishPowerSource {
    clients: Vec<(String, RedfishClient)>,
}

impl RedfishPowerSource {
    pub async fn connect(
        nodes: &[String],
        configs: &HashMap<String, RedfishConfig>,
    ) -> Result<Self, CollectionError> {
        let mut clients = Vec::with_capacity(nodes.len());
        for node in nodes {
            let config = configs.get(node).ok_or_else(|| CollectionError::MissingNode {
                node: node.clone(),
                what: "Redfish configuration",
            })?;
            clients.push((node.clone(), RedfishClient::connect(config).await?));
        }

        info!(nodes = clients.len(), "Initialized Redfish power source");
        Ok(Self { clients })
    }
}

#[async_trait]
impl PowerSource for RedfishPowerSource {
    fn name(&self) -> &str {
        "redfish"
    }

    async fn power_watts(&self) -> Result<NodePower, CollectionError> {
        let mut power = HashMap::with_capacity(self.clients.len());
        for (node, client) in &self.clients {
            power.insert(node.clone(), client.total_power_watts().await?);
        }
        Ok(power)
    }
}
