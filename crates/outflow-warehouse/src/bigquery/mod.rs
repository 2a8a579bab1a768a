//! Google BigQuery over the v2 REST API.
//!
//! Reads run through `jobs.query` and page with `getQueryResults`. Staged
//! writes upload CSV to Cloud Storage and run a load job against it.

mod auth;
mod config;
mod types;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use outflow_types::error::{ConnectorError, Result};
use outflow_types::model::ConnectionType;
use outflow_types::schema::{Row, Schema, Value};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

pub use config::{BigQueryConfig, Credentials};
pub use types::field_type;

use self::auth::TokenProvider;
use self::types::{TableFieldSchema, TableRow, TableSchema};
use crate::client::{
    LoadMode, QueryResult, RowIterator, StagingClient, StagingOptions, WarehouseClient,
};
use crate::http;
use crate::registry::{parse_config, ClientFactory};

/// Server-side wait per `getQueryResults` long poll.
const POLL_TIMEOUT_MS: u64 = 10_000;
const LOAD_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: JobReference,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetList {
    #[serde(default)]
    datasets: Vec<DatasetEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetEntry {
    dataset_reference: DatasetReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference {
    dataset_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableList {
    #[serde(default)]
    tables: Vec<TableEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableEntry {
    table_reference: TableReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    table_id: String,
}

#[derive(Debug, Deserialize)]
struct TableResource {
    #[serde(default)]
    schema: TableSchema,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    #[serde(default)]
    status: JobStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    error_result: Option<JobError>,
}

#[derive(Debug, Deserialize)]
struct JobError {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

impl JobError {
    fn into_error(self) -> ConnectorError {
        let code = format!("BQ_{}", self.reason.to_ascii_uppercase());
        match self.reason.as_str() {
            "accessDenied" => ConnectorError::permission(code, self.message),
            "rateLimitExceeded" | "quotaExceeded" => {
                ConnectorError::rate_limit(code, self.message, None)
            }
            "backendError" | "internalError" | "jobInternalError" => {
                ConnectorError::transient_db(code, self.message)
            }
            _ => ConnectorError::data(code, self.message),
        }
    }
}

/// Scalar type name and text form of a positional query parameter.
fn query_parameter(value: &Value) -> serde_json::Value {
    let ty = match value {
        Value::Null | Value::String(_) => "STRING",
        Value::Boolean(_) => "BOOL",
        Value::Integer(_) => "INT64",
        Value::Number(_) => "FLOAT64",
        Value::Date(_) => "DATE",
        Value::TimestampTz(_) => "TIMESTAMP",
        Value::TimestampNtz(_) => "DATETIME",
        Value::Json(_) => "JSON",
    };
    let parameter_value = if value.is_null() {
        json!({})
    } else {
        json!({ "value": value.to_string() })
    };
    json!({
        "parameterType": { "type": ty },
        "parameterValue": parameter_value,
    })
}

struct Api {
    http: reqwest::Client,
    config: BigQueryConfig,
    auth: TokenProvider,
}

impl Api {
    fn project_url(&self, suffix: &str) -> String {
        format!(
            "{}/projects/{}/{suffix}",
            self.config.api_url.trim_end_matches('/'),
            self.config.project_id
        )
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let token = self.auth.token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| http::transport_error(&e))?;
        http::json(response).await
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        self.send(self.http.get(url).query(query)).await
    }

    async fn post<T: DeserializeOwned>(&self, url: &str, body: &serde_json::Value) -> Result<T> {
        self.send(self.http.post(url).json(body)).await
    }

    /// Submit a query and wait until the first page is available.
    async fn start_query(&self, query: &str, args: &[Value]) -> Result<QueryResponse> {
        let mut body = json!({
            "query": query,
            "useLegacySql": false,
            "maxResults": self.config.page_size,
            "timeoutMs": POLL_TIMEOUT_MS,
            "formatOptions": { "useInt64Timestamp": true },
        });
        if let Some(location) = &self.config.location {
            body["location"] = json!(location);
        }
        if !args.is_empty() {
            body["parameterMode"] = json!("POSITIONAL");
            body["queryParameters"] = args.iter().map(query_parameter).collect();
        }

        let mut response: QueryResponse = self.post(&self.project_url("queries"), &body).await?;
        while !response.job_complete {
            tracing::debug!(job = %response.job_reference.job_id, "BigQuery job still running");
            response = self.query_page(&response.job_reference, None).await?;
        }
        Ok(response)
    }

    async fn query_page(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse> {
        let mut query = vec![
            ("maxResults", self.config.page_size.to_string()),
            ("timeoutMs", POLL_TIMEOUT_MS.to_string()),
            ("formatOptions.useInt64Timestamp", "true".to_string()),
        ];
        if let Some(location) = &job.location {
            query.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        self.get(&self.project_url(&format!("queries/{}", job.job_id)), &query)
            .await
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<reqwest::Url> {
        let base = self.config.storage_url.trim_end_matches('/');
        let mut url = reqwest::Url::parse(&format!("{base}/storage/v1/b")).map_err(|e| {
            ConnectorError::config("INVALID_URL", format!("storage_url '{base}': {e}"))
        })?;
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                ConnectorError::config("INVALID_URL", format!("storage_url '{base}' cannot be a base"))
            })?;
            segments.push(bucket).push("o").push(key);
        }
        Ok(url)
    }

    async fn wait_for_job(&self, mut job: Job) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(self.config.load_timeout_secs);
        loop {
            if job.status.state == "DONE" {
                return match job.status.error_result {
                    Some(err) => Err(err.into_error()),
                    None => Ok(()),
                };
            }
            if Instant::now() >= deadline {
                return Err(ConnectorError::transient_db(
                    "BQ_LOAD_TIMEOUT",
                    format!(
                        "load job {} not done after {}s",
                        job.job_reference.job_id, self.config.load_timeout_secs
                    ),
                ));
            }
            tokio::time::sleep(LOAD_POLL_INTERVAL).await;
            let mut query = Vec::new();
            if let Some(location) = &job.job_reference.location {
                query.push(("location", location.clone()));
            }
            let url = self.project_url(&format!("jobs/{}", job.job_reference.job_id));
            job = self.get(&url, &query).await?;
        }
    }
}

pub struct BigQueryClient {
    api: Arc<Api>,
}

impl BigQueryClient {
    /// # Errors
    ///
    /// Returns an `internal` error if the HTTP client cannot be built.
    pub fn new(config: BigQueryConfig) -> Result<Self> {
        let http = http::build_client(http::REQUEST_TIMEOUT)?;
        let auth = TokenProvider::new(http.clone(), config.credentials.clone());
        Ok(Self {
            api: Arc::new(Api { http, config, auth }),
        })
    }

    async fn pages(&self, query: &str, args: &[Value]) -> Result<QueryPages> {
        let first = self.api.start_query(query, args).await?;
        let table_schema = first.schema.unwrap_or_default();
        let fields = table_schema.fields.clone();
        let schema = types::canonical_schema(&table_schema);
        let buffer = first
            .rows
            .iter()
            .map(|row| types::decode_row(&fields, row))
            .collect();
        Ok(QueryPages {
            api: Arc::clone(&self.api),
            job: first.job_reference,
            fields,
            schema,
            buffer,
            page_token: first.page_token,
        })
    }
}

#[async_trait]
impl WarehouseClient for BigQueryClient {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::BigQuery
    }

    async fn get_namespaces(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let query: Vec<(&str, String)> =
                page_token.iter().map(|t| ("pageToken", t.clone())).collect();
            let page: DatasetList = self.api.get(&self.api.project_url("datasets"), &query).await?;
            names.extend(page.datasets.into_iter().map(|d| d.dataset_reference.dataset_id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(names),
            }
        }
    }

    async fn get_tables(&self, namespace: &str) -> Result<Vec<String>> {
        let url = self.api.project_url(&format!("datasets/{namespace}/tables"));
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let query: Vec<(&str, String)> =
                page_token.iter().map(|t| ("pageToken", t.clone())).collect();
            let page: TableList = self.api.get(&url, &query).await?;
            names.extend(page.tables.into_iter().map(|t| t.table_reference.table_id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(names),
            }
        }
    }

    async fn get_schema(&self, namespace: &str, table: &str) -> Result<Schema> {
        let url = self
            .api
            .project_url(&format!("datasets/{namespace}/tables/{table}"));
        let resource: TableResource = self.api.get(&url, &[]).await?;
        Ok(types::canonical_schema(&resource.schema))
    }

    async fn run_query(&self, query: &str, args: &[Value]) -> Result<QueryResult> {
        let mut pages = self.pages(query, args).await?;
        let mut rows = Vec::new();
        while let Some(row) = pages.next_row().await? {
            rows.push(row);
        }
        Ok(QueryResult {
            schema: pages.schema,
            rows,
        })
    }

    async fn get_query_iterator(&self, query: &str) -> Result<Box<dyn RowIterator>> {
        Ok(Box::new(self.pages(query, &[]).await?))
    }

    fn staging(&self) -> Option<&dyn StagingClient> {
        Some(self)
    }
}

#[async_trait]
impl StagingClient for BigQueryClient {
    async fn stage_data(&self, csv: Bytes, opts: &StagingOptions) -> Result<()> {
        let base = self.api.config.storage_url.trim_end_matches('/');
        let url = format!("{base}/upload/storage/v1/b/{}/o", opts.bucket);
        let size = csv.len();
        let request = self
            .api
            .http
            .post(url)
            .query(&[("uploadType", "media"), ("name", opts.object_key.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "text/csv")
            .body(csv);
        let _: serde_json::Value = self.api.send(request).await?;
        tracing::debug!(bucket = %opts.bucket, key = %opts.object_key, bytes = size, "Staged CSV to GCS");
        Ok(())
    }

    async fn load_from_staging(
        &self,
        namespace: &str,
        table: &str,
        opts: &StagingOptions,
    ) -> Result<()> {
        let write_disposition = match opts.load_mode {
            LoadMode::Truncate => "WRITE_TRUNCATE",
            LoadMode::Append => "WRITE_APPEND",
        };
        let mut body = json!({
            "configuration": {
                "load": {
                    "sourceUris": [format!("gs://{}/{}", opts.bucket, opts.object_key)],
                    "destinationTable": {
                        "projectId": self.api.config.project_id,
                        "datasetId": namespace,
                        "tableId": table,
                    },
                    "sourceFormat": "CSV",
                    "skipLeadingRows": 1,
                    "sourceColumnMatch": "NAME",
                    "allowQuotedNewlines": true,
                    "createDisposition": "CREATE_NEVER",
                    "writeDisposition": write_disposition,
                }
            }
        });
        if let Some(location) = &self.api.config.location {
            body["jobReference"] = json!({
                "projectId": self.api.config.project_id,
                "location": location,
            });
        }
        let job: Job = self.api.post(&self.api.project_url("jobs"), &body).await?;
        tracing::debug!(job = %job.job_reference.job_id, namespace, table, "BigQuery load job submitted");
        self.api.wait_for_job(job).await
    }

    async fn clean_up_staging_data(&self, opts: &StagingOptions) -> Result<()> {
        let url = self.api.object_url(&opts.bucket, &opts.object_key)?;
        let token = self.api.auth.token().await?;
        let response = self
            .api
            .http
            .delete(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| http::transport_error(&e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        http::check_response(response).await.map(|_| ())
    }
}

/// Result pages of one query job, fetched on demand.
struct QueryPages {
    api: Arc<Api>,
    job: JobReference,
    fields: Vec<TableFieldSchema>,
    schema: Schema,
    buffer: VecDeque<Row>,
    page_token: Option<String>,
}

#[async_trait]
impl RowIterator for QueryPages {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn next_row(&mut self) -> Result<Option<Row>> {
        while self.buffer.is_empty() {
            let Some(token) = self.page_token.take() else {
                return Ok(None);
            };
            let page = self.api.query_page(&self.job, Some(&token)).await?;
            self.buffer
                .extend(page.rows.iter().map(|row| types::decode_row(&self.fields, row)));
            self.page_token = page.page_token;
        }
        Ok(self.buffer.pop_front())
    }
}

pub struct BigQueryFactory;

#[async_trait]
impl ClientFactory for BigQueryFactory {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::BigQuery
    }

    async fn connect(&self, config: &serde_json::Value) -> Result<Arc<dyn WarehouseClient>> {
        let config: BigQueryConfig = parse_config(ConnectionType::BigQuery, config)?;
        Ok(Arc::new(BigQueryClient::new(config)?))
    }
}
