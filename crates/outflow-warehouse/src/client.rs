//! Warehouse client capability traits.
//!
//! [`WarehouseClient`] is the read side every dialect implements.
//! Destinations additionally expose either a [`StagingClient`] (CSV stage
//! then bulk load) or a [`DirectWriter`] (one call per batch).

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use outflow_types::error::{ConnectorError, Result};
use outflow_types::model::ConnectionType;
use outflow_types::schema::{Record, Row, Schema, Value};
use serde::{Deserialize, Serialize};

use crate::ident;
use crate::query::SelectQuery;

/// A fully materialized query result.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub schema: Schema,
    pub rows: Vec<Row>,
}

/// Streaming cursor over a query result.
#[async_trait]
pub trait RowIterator: Send {
    /// Result schema; fixed before the first row is returned.
    fn schema(&self) -> &Schema;

    /// Next row, or `None` once the result is exhausted.
    async fn next_row(&mut self) -> Result<Option<Row>>;
}

/// [`RowIterator`] over rows already in memory.
pub struct BufferedRows {
    schema: Schema,
    rows: VecDeque<Row>,
}

impl BufferedRows {
    #[must_use]
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self {
            schema,
            rows: rows.into(),
        }
    }
}

impl From<QueryResult> for BufferedRows {
    fn from(result: QueryResult) -> Self {
        Self::new(result.schema, result.rows)
    }
}

#[async_trait]
impl RowIterator for BufferedRows {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn next_row(&mut self) -> Result<Option<Row>> {
        Ok(self.rows.pop_front())
    }
}

/// Read-side capabilities shared by every warehouse dialect.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    fn connection_type(&self) -> ConnectionType;

    /// Namespaces (datasets, schemas, databases) visible to the credentials.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the failure.
    async fn get_namespaces(&self) -> Result<Vec<String>>;

    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the failure.
    async fn get_tables(&self, namespace: &str) -> Result<Vec<String>>;

    /// Column names and canonical types of a table.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the failure.
    async fn get_schema(&self, namespace: &str, table: &str) -> Result<Schema>;

    /// Up to `limit` distinct values of one column.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the failure.
    async fn get_field_values(
        &self,
        namespace: &str,
        table: &str,
        field: &str,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let query = format!(
            "SELECT DISTINCT {} FROM {} LIMIT {limit}",
            ident::validate(field)?,
            ident::qualified(namespace, table)?,
        );
        let result = self.run_query(&query, &[]).await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }

    /// Run a query with positional arguments and collect every row.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the failure.
    async fn run_query(&self, query: &str, args: &[Value]) -> Result<QueryResult>;

    /// Run a query and stream its rows.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the failure.
    async fn get_query_iterator(&self, query: &str) -> Result<Box<dyn RowIterator>>;

    /// Render a replication read in this dialect's query language.
    ///
    /// # Errors
    ///
    /// Returns a `config` error for invalid identifiers or plans.
    fn render_select(&self, select: &SelectQuery) -> Result<String> {
        select.to_sql()
    }

    /// Cheap connectivity check.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the failure.
    async fn check(&self) -> Result<()> {
        self.get_namespaces().await.map(|_| ())
    }

    /// Bulk-load capability, when this dialect can act as a staged destination.
    fn staging(&self) -> Option<&dyn StagingClient> {
        None
    }

    /// Per-batch write capability, when this dialect accepts direct calls.
    fn direct_writer(&self) -> Option<&dyn DirectWriter> {
        None
    }
}

/// How a staged file lands in the destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Replace the table contents.
    Truncate,
    Append,
}

/// Location and shape of one staged CSV file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingOptions {
    pub bucket: String,
    pub object_key: String,
    /// Destination columns in CSV order, end-customer column last.
    pub columns: Vec<String>,
    pub load_mode: LoadMode,
}

/// Stage-then-load destination capability.
#[async_trait]
pub trait StagingClient: Send + Sync {
    /// Upload one CSV payload to the staging bucket.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the failure.
    async fn stage_data(&self, csv: Bytes, opts: &StagingOptions) -> Result<()>;

    /// Load the staged file into `namespace.table`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the failure.
    async fn load_from_staging(
        &self,
        namespace: &str,
        table: &str,
        opts: &StagingOptions,
    ) -> Result<()>;

    /// Delete the staged file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the failure.
    async fn clean_up_staging_data(&self, opts: &StagingOptions) -> Result<()>;
}

/// Wire envelope of one direct-call batch.
#[derive(Debug, Serialize)]
pub struct BatchEnvelope<'a> {
    pub object_name: &'a str,
    pub end_customer_id: i64,
    pub data: &'a [Record],
}

/// Direct-call destination capability.
#[async_trait]
pub trait DirectWriter: Send + Sync {
    /// Deliver one batch of projected records.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] classified by the failure.
    async fn send_batch(&self, envelope: &BatchEnvelope<'_>) -> Result<()>;
}

/// Error for capabilities a dialect does not offer.
#[must_use]
pub fn unsupported(connection_type: ConnectionType, what: &str) -> ConnectorError {
    ConnectorError::config(
        "UNSUPPORTED",
        format!("{connection_type} connections do not support {what}"),
    )
}
