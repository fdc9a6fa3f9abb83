use super::{async_trait, PowerSource};
use crate::error::CollectionError;
use crate::models::NodePower;
use std::collections::HashMap;

/// Reports fixed per-node power, for dry runs without BMC access
pub struct ConstantPowerSource {
    watts: HashMap<String, f64>,
}

impl ConstantPowerSource {
    pub fn new(watts: HashMap<String, f64>) -> Self {
        Self { watts }
    }
}

#[async_trait]
impl PowerSource for ConstantPowerSource {
    fn name(&self) -> &str {
        "constant"
    }

    async fn power_watts(&self) -> Result<NodePower, CollectionError> {
        Ok(self.watts.clone())
    }
}
