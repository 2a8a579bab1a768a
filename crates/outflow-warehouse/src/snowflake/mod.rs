//! Snowflake over the SQL API v2.
//!
//! Statements are submitted with key-pair JWT auth. Long-running statements
//! answer `202` and are polled by handle; large results are split into
//! partitions fetched one at a time while iterating.

mod auth;
mod config;
mod types;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use outflow_types::error::{ConnectorError, Result};
use outflow_types::model::ConnectionType;
use outflow_types::schema::{Field, Row, Schema, Value};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

pub use config::SnowflakeConfig;
pub use types::field_type;

use self::auth::KeyPairAuth;
use self::types::RowType;
use crate::client::{QueryResult, RowIterator, WarehouseClient};
use crate::http;
use crate::registry::{parse_config, ClientFactory};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
    #[serde(default)]
    statement_handle: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<serde_json::Value>,
}

/// Bind value in the SQL API's `{"type", "value"}` form.
fn binding(value: &Value) -> serde_json::Value {
    let ty = match value {
        Value::Boolean(_) => "BOOLEAN",
        Value::Integer(_) => "FIXED",
        Value::Number(_) => "REAL",
        _ => "TEXT",
    };
    let value = if value.is_null() {
        serde_json::Value::Null
    } else {
        json!(value.to_string())
    };
    json!({ "type": ty, "value": value })
}

struct Api {
    http: reqwest::Client,
    config: SnowflakeConfig,
    base_url: String,
    auth: Mutex<KeyPairAuth>,
}

impl Api {
    async fn request(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.auth.lock().await.token()?;
        let response = builder
            .bearer_auth(token)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| http::transport_error(&e))?;
        http::check_response(response).await
    }

    fn statement_url(&self, handle: &str) -> String {
        format!("{}/api/v2/statements/{handle}", self.base_url)
    }

    /// Submit a statement and wait for its first partition.
    async fn execute(&self, statement: &str, args: &[Value]) -> Result<StatementResponse> {
        let mut body = json!({
            "statement": statement,
            "timeout": self.config.statement_timeout_secs,
            "database": self.config.database,
        });
        if let Some(warehouse) = &self.config.warehouse {
            body["warehouse"] = json!(warehouse);
        }
        if let Some(role) = &self.config.role {
            body["role"] = json!(role);
        }
        if !args.is_empty() {
            let bindings: serde_json::Map<String, serde_json::Value> = args
                .iter()
                .enumerate()
                .map(|(i, v)| ((i + 1).to_string(), binding(v)))
                .collect();
            body["bindings"] = serde_json::Value::Object(bindings);
        }

        let url = format!("{}/api/v2/statements", self.base_url);
        let mut response = self.request(self.http.post(url).json(&body)).await?;
        while response.status() == reqwest::StatusCode::ACCEPTED {
            let pending: StatementResponse = response
                .json()
                .await
                .map_err(|e| http::transport_error(&e))?;
            tracing::debug!(handle = %pending.statement_handle, "Snowflake statement still running");
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
            response = self
                .request(self.http.get(self.statement_url(&pending.statement_handle)))
                .await?;
        }
        response.json().await.map_err(|e| http::transport_error(&e))
    }

    async fn partition(&self, handle: &str, partition: usize) -> Result<StatementResponse> {
        let request = self
            .http
            .get(self.statement_url(handle))
            .query(&[("partition", partition.to_string())]);
        self.request(request)
            .await?
            .json()
            .await
            .map_err(|e| http::transport_error(&e))
    }
}

pub struct SnowflakeClient {
    api: Arc<Api>,
}

impl SnowflakeClient {
    /// # Errors
    ///
    /// Returns a `config` error for an unreadable private key.
    pub fn new(config: SnowflakeConfig) -> Result<Self> {
        let auth = KeyPairAuth::new(
            &config.account,
            &config.user,
            config.private_key.expose_secret(),
            config.token_lifetime_secs,
        )?;
        let http = http::build_client(Duration::from_secs(config.statement_timeout_secs + 30))?;
        Ok(Self {
            api: Arc::new(Api {
                http,
                base_url: config.api_url(),
                config,
                auth: Mutex::new(auth),
            }),
        })
    }

    async fn partitions(&self, statement: &str, args: &[Value]) -> Result<Partitions> {
        let first = self.api.execute(statement, args).await?;
        let meta = first.result_set_meta_data.ok_or_else(|| {
            ConnectorError::data("NO_RESULT_SET", "statement returned no result set metadata")
        })?;
        let schema = types::canonical_schema(&meta.row_type);
        let buffer = first
            .data
            .iter()
            .map(|cells| types::decode_row(&schema, cells))
            .collect();
        Ok(Partitions {
            api: Arc::clone(&self.api),
            handle: first.statement_handle,
            schema,
            buffer,
            next_partition: 1,
            partition_count: meta.partition_info.len().max(1),
        })
    }

    async fn strings(&self, statement: &str, args: &[Value]) -> Result<Vec<String>> {
        let result = self.run_query(statement, args).await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(Value::String(s)) => Some(s),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl WarehouseClient for SnowflakeClient {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Snowflake
    }

    async fn get_namespaces(&self) -> Result<Vec<String>> {
        self.strings(
            "SELECT schema_name FROM information_schema.schemata \
             WHERE schema_name <> 'INFORMATION_SCHEMA' ORDER BY schema_name",
            &[],
        )
        .await
    }

    async fn get_tables(&self, namespace: &str) -> Result<Vec<String>> {
        self.strings(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = ? ORDER BY table_name",
            &[Value::String(namespace.to_string())],
        )
        .await
    }

    async fn get_schema(&self, namespace: &str, table: &str) -> Result<Schema> {
        let result = self
            .run_query(
                "SELECT column_name, data_type, numeric_scale FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
                &[
                    Value::String(namespace.to_string()),
                    Value::String(table.to_string()),
                ],
            )
            .await?;
        let fields = result
            .rows
            .into_iter()
            .filter_map(|row| {
                let mut cells = row.into_iter();
                let Some(Value::String(name)) = cells.next() else {
                    return None;
                };
                let native = match cells.next() {
                    Some(Value::String(native)) => native,
                    _ => String::new(),
                };
                let scale = match cells.next() {
                    Some(Value::Integer(scale)) => Some(scale),
                    _ => None,
                };
                Some(Field::new(name, field_type(&native, scale)))
            })
            .collect();
        Ok(Schema::new(fields))
    }

    async fn run_query(&self, query: &str, args: &[Value]) -> Result<QueryResult> {
        let mut partitions = self.partitions(query, args).await?;
        let mut rows = Vec::new();
        while let Some(row) = partitions.next_row().await? {
            rows.push(row);
        }
        Ok(QueryResult {
            schema: partitions.schema,
            rows,
        })
    }

    async fn get_query_iterator(&self, query: &str) -> Result<Box<dyn RowIterator>> {
        Ok(Box::new(self.partitions(query, &[]).await?))
    }
}

/// Result partitions of one statement, fetched on demand.
struct Partitions {
    api: Arc<Api>,
    handle: String,
    schema: Schema,
    buffer: VecDeque<Row>,
    next_partition: usize,
    partition_count: usize,
}

#[async_trait]
impl RowIterator for Partitions {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn next_row(&mut self) -> Result<Option<Row>> {
        while self.buffer.is_empty() && self.next_partition < self.partition_count {
            let page = self.api.partition(&self.handle, self.next_partition).await?;
            self.next_partition += 1;
            self.buffer
                .extend(page.data.iter().map(|cells| types::decode_row(&self.schema, cells)));
        }
        Ok(self.buffer.pop_front())
    }
}

pub struct SnowflakeFactory;

#[async_trait]
impl ClientFactory for SnowflakeFactory {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Snowflake
    }

    async fn connect(&self, config: &serde_json::Value) -> Result<Arc<dyn WarehouseClient>> {
        let config: SnowflakeConfig = parse_config(ConnectionType::Snowflake, config)?;
        Ok(Arc::new(SnowflakeClient::new(config)?))
    }
}
