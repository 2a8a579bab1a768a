//! Webhook destination: one JSON POST per batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use outflow_types::error::{ConnectorError, Result};
use outflow_types::model::ConnectionType;
use outflow_types::schema::{Schema, Value};
use serde::{Deserialize, Serialize};

use crate::client::{
    unsupported, BatchEnvelope, DirectWriter, QueryResult, RowIterator, WarehouseClient,
};
use crate::http;
use crate::registry::{parse_config, ClientFactory};
use crate::secret::SensitiveString;

fn default_timeout_secs() -> u64 {
    30
}

/// Webhook connection config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Extra request headers, e.g. `Authorization`.
    #[serde(default)]
    pub headers: BTreeMap<String, SensitiveString>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

pub struct WebhookClient {
    http: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookClient {
    /// # Errors
    ///
    /// Returns a `config` error for an unparseable URL.
    pub fn new(config: WebhookConfig) -> Result<Self> {
        reqwest::Url::parse(&config.url).map_err(|e| {
            ConnectorError::config("INVALID_URL", format!("webhook url '{}': {e}", config.url))
        })?;
        let http = http::build_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl WarehouseClient for WebhookClient {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Webhook
    }

    async fn get_namespaces(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_tables(&self, _namespace: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_schema(&self, _namespace: &str, _table: &str) -> Result<Schema> {
        Ok(Schema::default())
    }

    async fn get_field_values(
        &self,
        _namespace: &str,
        _table: &str,
        _field: &str,
        _limit: usize,
    ) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }

    async fn run_query(&self, _query: &str, _args: &[Value]) -> Result<QueryResult> {
        Err(unsupported(ConnectionType::Webhook, "queries"))
    }

    async fn get_query_iterator(&self, _query: &str) -> Result<Box<dyn RowIterator>> {
        Err(unsupported(ConnectionType::Webhook, "queries"))
    }

    async fn check(&self) -> Result<()> {
        Ok(())
    }

    fn direct_writer(&self) -> Option<&dyn DirectWriter> {
        Some(self)
    }
}

#[async_trait]
impl DirectWriter for WebhookClient {
    async fn send_batch(&self, envelope: &BatchEnvelope<'_>) -> Result<()> {
        let mut request = self.http.post(&self.config.url).json(envelope);
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.expose_secret());
        }
        let response = request.send().await.map_err(|e| http::transport_error(&e))?;
        http::check_response(response).await?;
        tracing::debug!(
            object = envelope.object_name,
            records = envelope.data.len(),
            "Webhook batch delivered"
        );
        Ok(())
    }
}

pub struct WebhookFactory;

#[async_trait]
impl ClientFactory for WebhookFactory {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Webhook
    }

    async fn connect(&self, config: &serde_json::Value) -> Result<Arc<dyn WarehouseClient>> {
        let config: WebhookConfig = parse_config(ConnectionType::Webhook, config)?;
        Ok(Arc::new(WebhookClient::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outflow_types::error::ErrorCategory;
    use outflow_types::schema::Record;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> WebhookClient {
        WebhookClient::new(WebhookConfig {
            url: format!("{}/hooks/outflow", server.uri()),
            headers: BTreeMap::from([(
                "Authorization".to_string(),
                SensitiveString::new("Bearer t0k"),
            )]),
            timeout_secs: 5,
        })
        .unwrap()
    }

    fn records() -> Vec<Record> {
        let mut record = Record::new();
        record.insert("email".into(), serde_json::json!("a@example.com"));
        record.insert("attrs".into(), serde_json::json!({"plan": null}));
        vec![record]
    }

    #[tokio::test]
    async fn posts_envelope_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/outflow"))
            .and(header("Authorization", "Bearer t0k"))
            .and(body_json(serde_json::json!({
                "object_name": "contacts",
                "end_customer_id": 42,
                "data": [{"attrs": {"plan": null}, "email": "a@example.com"}]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let data = records();
        client(&server)
            .send_batch(&BatchEnvelope {
                object_name: "contacts",
                end_customer_id: 42,
                data: &data,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let data = records();
        let err = client(&server)
            .send_batch(&BatchEnvelope {
                object_name: "contacts",
                end_customer_id: 1,
                data: &data,
            })
            .await
            .unwrap_err();
        assert!(err.retryable);
        assert_eq!(err.category, ErrorCategory::TransientNetwork);
    }

    #[tokio::test]
    async fn rejected_payload_is_data_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad field"))
            .mount(&server)
            .await;

        let data = records();
        let err = client(&server)
            .send_batch(&BatchEnvelope {
                object_name: "contacts",
                end_customer_id: 1,
                data: &data,
            })
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("bad field"));
    }

    #[test]
    fn invalid_url_is_config_error() {
        let err = WebhookClient::new(WebhookConfig {
            url: "not a url".into(),
            headers: BTreeMap::new(),
            timeout_secs: 5,
        })
        .err()
        .unwrap();
        assert_eq!(err.category, ErrorCategory::Config);
    }

    #[tokio::test]
    async fn queries_are_unsupported() {
        let client = WebhookClient::new(WebhookConfig {
            url: "http://localhost/hook".into(),
            headers: BTreeMap::new(),
            timeout_secs: 5,
        })
        .unwrap();
        assert!(client.run_query("SELECT 1", &[]).await.is_err());
        assert!(client.direct_writer().is_some());
        assert!(client.staging().is_none());
    }
}
