//! BigQuery connection configuration.

use serde::{Deserialize, Serialize};

use crate::secret::SensitiveString;

pub(crate) const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

fn default_api_url() -> String {
    "https://bigquery.googleapis.com/bigquery/v2".to_string()
}

fn default_storage_url() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_page_size() -> u32 {
    10_000
}

fn default_load_timeout_secs() -> u64 {
    600
}

/// BigQuery connection config.
///
/// `credentials` accepts a service-account key file verbatim (its `type`
/// field is `service_account`) or a pre-issued OAuth access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigQueryConfig {
    pub project_id: String,
    #[serde(default)]
    pub location: Option<String>,
    pub credentials: Credentials,
    /// Rows requested per result page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_storage_url")]
    pub storage_url: String,
    /// Upper bound on waiting for a load job to finish.
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    ServiceAccount {
        client_email: String,
        private_key: SensitiveString,
        #[serde(default = "default_token_uri")]
        token_uri: String,
    },
    AccessToken {
        token: SensitiveString,
    },
}
