//! Redshift connection configuration.

use serde::{Deserialize, Serialize};

use crate::secret::SensitiveString;

fn default_port() -> u16 {
    5439
}

fn default_fetch_size() -> usize {
    10_000
}

/// Redshift connection config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedshiftConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: SensitiveString,
    /// Rows pulled per `FETCH` from the server-side cursor.
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
    /// Required when the connection is used as a staged destination.
    #[serde(default)]
    pub s3: Option<S3StagingConfig>,
}

/// S3 bucket access and the IAM role Redshift assumes for `COPY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StagingConfig {
    pub region: String,
    pub iam_role: String,
    #[serde(default)]
    pub access_key_id: Option<SensitiveString>,
    #[serde(default)]
    pub secret_access_key: Option<SensitiveString>,
    /// S3-compatible endpoint override (path-style addressing).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config: RedshiftConfig = serde_json::from_value(serde_json::json!({
            "host": "cluster.example.com",
            "database": "dev",
            "user": "loader",
            "password": "pw"
        }))
        .unwrap();
        assert_eq!(config.port, 5439);
        assert_eq!(config.fetch_size, 10_000);
        assert!(config.s3.is_none());
        assert!(!format!("{config:?}").contains("\"pw\""));
    }
}
