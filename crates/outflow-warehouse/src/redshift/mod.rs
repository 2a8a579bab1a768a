//! Amazon Redshift over the `PostgreSQL` wire protocol.
//!
//! Reads stream through a server-side cursor (`DECLARE` / `FETCH n`) on a
//! dedicated connection. Staged writes upload CSV to S3 and `COPY` it in one
//! transaction.

mod config;
mod decode;
mod staging;
mod types;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use outflow_types::error::{ConnectorError, Result};
use outflow_types::model::ConnectionType;
use outflow_types::schema::{Field, Row, Schema, Value};
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config as PgConfig, NoTls};

pub use config::{RedshiftConfig, S3StagingConfig};
pub use staging::S3Stager;
pub use types::field_type;

use crate::client::{
    QueryResult, RowIterator, StagingClient, StagingOptions, WarehouseClient,
};
use crate::registry::{parse_config, ClientFactory};

const CURSOR_NAME: &str = "outflow_read";

/// Map a driver error into the taxonomy using its SQLSTATE class.
pub(crate) fn pg_error(err: &tokio_postgres::Error) -> ConnectorError {
    let Some(db) = err.as_db_error() else {
        return ConnectorError::transient_network("PG_CONNECTION", err.to_string());
    };
    let code = db.code().code();
    let message = db.message().to_string();
    let tag = format!("PG_{code}");
    match code.get(..2).unwrap_or_default() {
        "28" => ConnectorError::auth(tag, message),
        "42" if code == "42501" => ConnectorError::permission(tag, message),
        "42" | "22" | "23" => ConnectorError::data(tag, message),
        _ => ConnectorError::transient_db(tag, message),
    }
}

async fn connect(config: &RedshiftConfig) -> Result<Client> {
    let mut pg = PgConfig::new();
    pg.host(&config.host);
    pg.port(config.port);
    pg.user(&config.user);
    pg.password(config.password.expose_secret());
    pg.dbname(&config.database);

    let (client, connection) = pg.connect(NoTls).await.map_err(|e| pg_error(&e))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "Redshift connection closed with error");
        }
    });
    Ok(client)
}

fn owned_param(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Boolean(b) => Box::new(*b),
        Value::Integer(i) => Box::new(*i),
        Value::Number(n) => Box::new(*n),
        Value::String(s) => Box::new(s.clone()),
        Value::Date(d) => Box::new(*d),
        Value::TimestampTz(ts) => Box::new(*ts),
        Value::TimestampNtz(ts) => Box::new(*ts),
        Value::Json(v) => Box::new(v.clone()),
    }
}

pub struct RedshiftClient {
    config: RedshiftConfig,
    client: Mutex<Client>,
    stager: Option<S3Stager>,
}

impl RedshiftClient {
    /// Connect and, when S3 staging is configured, build the S3 client.
    ///
    /// # Errors
    ///
    /// Returns a classified error when the connection fails.
    pub async fn connect(config: RedshiftConfig) -> Result<Self> {
        let client = connect(&config).await?;
        let stager = match &config.s3 {
            Some(s3) => Some(S3Stager::new(s3).await),
            None => None,
        };
        Ok(Self {
            config,
            client: Mutex::new(client),
            stager,
        })
    }

    async fn statement_schema(client: &Client, query: &str) -> Result<Schema> {
        let statement = client.prepare(query).await.map_err(|e| pg_error(&e))?;
        Ok(Schema::new(
            statement
                .columns()
                .iter()
                .map(|c| Field::new(c.name(), field_type(c.type_().name())))
                .collect(),
        ))
    }

    async fn strings(&self, query: &str, args: &[&(dyn ToSql + Sync)]) -> Result<Vec<String>> {
        let client = self.client.lock().await;
        let rows = client.query(query, args).await.map_err(|e| pg_error(&e))?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(|e| pg_error(&e)))
            .collect()
    }
}

#[async_trait]
impl WarehouseClient for RedshiftClient {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Redshift
    }

    async fn get_namespaces(&self) -> Result<Vec<String>> {
        self.strings(
            "SELECT nspname::text FROM pg_namespace \
             WHERE nspname NOT LIKE 'pg\\_%' AND nspname <> 'information_schema' \
             ORDER BY nspname",
            &[],
        )
        .await
    }

    async fn get_tables(&self, namespace: &str) -> Result<Vec<String>> {
        self.strings(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1 ORDER BY table_name",
            &[&namespace],
        )
        .await
    }

    async fn get_schema(&self, namespace: &str, table: &str) -> Result<Schema> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT column_name::text, data_type::text FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                &[&namespace, &table],
            )
            .await
            .map_err(|e| pg_error(&e))?;
        let fields = rows
            .iter()
            .map(|row| {
                let name: String = row.try_get(0).map_err(|e| pg_error(&e))?;
                let native: String = row.try_get(1).map_err(|e| pg_error(&e))?;
                Ok(Field::new(name, field_type(&native)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Schema::new(fields))
    }

    async fn run_query(&self, query: &str, args: &[Value]) -> Result<QueryResult> {
        let owned: Vec<Box<dyn ToSql + Sync + Send>> = args.iter().map(owned_param).collect();
        let params: Vec<&(dyn ToSql + Sync)> = owned
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let client = self.client.lock().await;
        let schema = Self::statement_schema(&client, query).await?;
        let rows = client
            .query(query, &params)
            .await
            .map_err(|e| pg_error(&e))?
            .iter()
            .map(|row| decode::decode_row(row).map_err(|e| pg_error(&e)))
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryResult { schema, rows })
    }

    async fn get_query_iterator(&self, query: &str) -> Result<Box<dyn RowIterator>> {
        let client = connect(&self.config).await?;
        let schema = Self::statement_schema(&client, query).await?;
        client
            .batch_execute(&format!(
                "BEGIN; DECLARE {CURSOR_NAME} NO SCROLL CURSOR FOR {query}"
            ))
            .await
            .map_err(|e| pg_error(&e))?;
        Ok(Box::new(CursorRows {
            client,
            schema,
            buffer: VecDeque::new(),
            fetch: format!("FETCH {} FROM {CURSOR_NAME}", self.config.fetch_size.max(1)),
            exhausted: false,
        }))
    }

    fn staging(&self) -> Option<&dyn StagingClient> {
        self.stager.as_ref().map(|_| self as &dyn StagingClient)
    }
}

#[async_trait]
impl StagingClient for RedshiftClient {
    async fn stage_data(&self, csv: Bytes, opts: &StagingOptions) -> Result<()> {
        self.stager()?.put(csv, opts).await
    }

    async fn load_from_staging(
        &self,
        namespace: &str,
        table: &str,
        opts: &StagingOptions,
    ) -> Result<()> {
        let stager = self.stager()?;
        let statements = stager.load_statements(namespace, table, opts)?;
        let client = self.client.lock().await;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| pg_error(&e))?;
        for statement in &statements {
            if let Err(e) = client.batch_execute(statement).await {
                if let Err(rollback) = client.batch_execute("ROLLBACK").await {
                    tracing::warn!(error = %rollback, "Redshift ROLLBACK failed");
                }
                return Err(pg_error(&e));
            }
        }
        client
            .batch_execute("COMMIT")
            .await
            .map_err(|e| pg_error(&e))?;
        tracing::debug!(namespace, table, key = %opts.object_key, "Redshift COPY committed");
        Ok(())
    }

    async fn clean_up_staging_data(&self, opts: &StagingOptions) -> Result<()> {
        self.stager()?.delete(opts).await
    }
}

impl RedshiftClient {
    fn stager(&self) -> Result<&S3Stager> {
        self.stager.as_ref().ok_or_else(|| {
            ConnectorError::config("NO_STAGING", "redshift connection has no s3 staging config")
        })
    }
}

/// Rows from a server-side cursor, fetched `fetch_size` at a time.
struct CursorRows {
    client: Client,
    schema: Schema,
    buffer: VecDeque<Row>,
    fetch: String,
    exhausted: bool,
}

#[async_trait]
impl RowIterator for CursorRows {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn next_row(&mut self) -> Result<Option<Row>> {
        if self.buffer.is_empty() && !self.exhausted {
            let rows = self
                .client
                .query(&self.fetch, &[])
                .await
                .map_err(|e| pg_error(&e))?;
            if rows.is_empty() {
                self.exhausted = true;
                self.client
                    .batch_execute(&format!("CLOSE {CURSOR_NAME}; COMMIT"))
                    .await
                    .map_err(|e| pg_error(&e))?;
            }
            for row in &rows {
                self.buffer
                    .push_back(decode::decode_row(row).map_err(|e| pg_error(&e))?);
            }
        }
        Ok(self.buffer.pop_front())
    }
}

pub struct RedshiftFactory;

#[async_trait]
impl ClientFactory for RedshiftFactory {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Redshift
    }

    async fn connect(&self, config: &serde_json::Value) -> Result<Arc<dyn WarehouseClient>> {
        let config: RedshiftConfig = parse_config(ConnectionType::Redshift, config)?;
        Ok(Arc::new(RedshiftClient::connect(config).await?))
    }
}
