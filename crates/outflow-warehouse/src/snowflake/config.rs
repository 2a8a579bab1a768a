//! Snowflake connection configuration.

use serde::{Deserialize, Serialize};

use crate::secret::SensitiveString;

fn default_statement_timeout_secs() -> u64 {
    300
}

fn default_token_lifetime_secs() -> u64 {
    3600
}

/// Snowflake connection config. Authenticates with an unencrypted PKCS#8
/// RSA key registered on the user (`ALTER USER … SET RSA_PUBLIC_KEY`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnowflakeConfig {
    /// Account identifier, e.g. `xy12345.us-east-1` or `myorg-myaccount`.
    pub account: String,
    pub user: String,
    pub private_key: SensitiveString,
    pub database: String,
    #[serde(default)]
    pub warehouse: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
    #[serde(default = "default_token_lifetime_secs")]
    pub token_lifetime_secs: u64,
    /// Overrides `https://{account}.snowflakecomputing.com`.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl SnowflakeConfig {
    #[must_use]
    pub fn api_url(&self) -> String {
        self.base_url.as_ref().map_or_else(
            || format!("https://{}.snowflakecomputing.com", self.account.to_lowercase()),
            |url| url.trim_end_matches('/').to_string(),
        )
    }
}
