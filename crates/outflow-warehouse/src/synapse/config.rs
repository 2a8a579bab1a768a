//! Azure Synapse (dedicated SQL pool) connection configuration.

use serde::{Deserialize, Serialize};

use crate::secret::SensitiveString;

fn default_port() -> u16 {
    1433
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynapseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: SensitiveString,
    /// Accept the server certificate without validation.
    #[serde(default)]
    pub trust_cert: bool,
}
