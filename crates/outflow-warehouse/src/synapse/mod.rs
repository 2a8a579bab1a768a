//! Azure Synapse dedicated SQL pools over TDS.
//!
//! Results are materialized per statement; `get_query_iterator` yields from
//! the buffered result.

mod config;
mod types;

use std::sync::Arc;

use async_trait::async_trait;
use outflow_types::error::{ConnectorError, Result};
use outflow_types::model::ConnectionType;
use outflow_types::schema::{Field, Schema, Value};
use tiberius::{AuthMethod, Client, Config};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

pub use config::SynapseConfig;
pub use types::field_type;

use self::types::SqlParam;
use crate::client::{BufferedRows, QueryResult, RowIterator, WarehouseClient};
use crate::ident;
use crate::registry::{parse_config, ClientFactory};

/// Map a TDS failure into the taxonomy using the server error number.
fn tds_error(err: &tiberius::error::Error) -> ConnectorError {
    match err {
        tiberius::error::Error::Server(token) => {
            let code = format!("MSSQL_{}", token.code());
            let message = token.message().to_string();
            match token.code() {
                18456 | 18452 => ConnectorError::auth(code, message),
                229 | 230 | 262 | 300 | 916 => ConnectorError::permission(code, message),
                1205 | 40197 | 40501 | 40613 | 49918 | 49919 | 49920 => {
                    ConnectorError::transient_db(code, message)
                }
                _ => ConnectorError::data(code, message),
            }
        }
        tiberius::error::Error::Io { .. }
        | tiberius::error::Error::Tls(_)
        | tiberius::error::Error::Routing { .. } => {
            ConnectorError::transient_network("MSSQL_CONNECTION", err.to_string())
        }
        _ => ConnectorError::data("MSSQL_PROTOCOL", err.to_string()),
    }
}

pub struct SynapseClient {
    client: Mutex<Client<Compat<TcpStream>>>,
}

impl SynapseClient {
    /// # Errors
    ///
    /// Returns a classified error when the TCP connection or login fails.
    pub async fn connect(config: &SynapseConfig) -> Result<Self> {
        let mut tds = Config::new();
        tds.host(&config.host);
        tds.port(config.port);
        tds.database(&config.database);
        tds.authentication(AuthMethod::sql_server(
            &config.user,
            config.password.expose_secret(),
        ));
        if config.trust_cert {
            tds.trust_cert();
        }

        let tcp = TcpStream::connect(tds.get_addr()).await.map_err(|e| {
            ConnectorError::transient_network("MSSQL_CONNECTION", format!("connect: {e}"))
        })?;
        tcp.set_nodelay(true).ok();

        let client = Client::connect(tds, tcp.compat_write())
            .await
            .map_err(|e| tds_error(&e))?;
        tracing::debug!(host = %config.host, database = %config.database, "Connected to Synapse");
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    async fn strings(&self, query: &str, args: &[Value]) -> Result<Vec<String>> {
        let result = self.run_query(query, args).await?;
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
impl WarehouseClient for SynapseClient {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Synapse
    }

    async fn get_namespaces(&self) -> Result<Vec<String>> {
        self.strings(
            "SELECT name FROM sys.schemas \
             WHERE name NOT IN ('sys', 'INFORMATION_SCHEMA', 'guest') \
             AND name NOT LIKE 'db[_]%' ORDER BY name",
            &[],
        )
        .await
    }

    async fn get_tables(&self, namespace: &str) -> Result<Vec<String>> {
        self.strings(
            "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_SCHEMA = @P1 ORDER BY TABLE_NAME",
            &[Value::String(namespace.to_string())],
        )
        .await
    }

    async fn get_schema(&self, namespace: &str, table: &str) -> Result<Schema> {
        let result = self
            .run_query(
                "SELECT COLUMN_NAME, DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 ORDER BY ORDINAL_POSITION",
                &[
                    Value::String(namespace.to_string()),
                    Value::String(table.to_string()),
                ],
            )
            .await?;
        let fields = result
            .rows
            .into_iter()
            .filter_map(|row| match row.as_slice() {
                [Value::String(name), Value::String(native)] => {
                    Some(Field::new(name.clone(), field_type(native)))
                }
                _ => None,
            })
            .collect();
        Ok(Schema::new(fields))
    }

    async fn get_field_values(
        &self,
        namespace: &str,
        table: &str,
        field: &str,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let query = format!(
            "SELECT DISTINCT TOP {limit} {} FROM {}",
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

    async fn run_query(&self, query: &str, args: &[Value]) -> Result<QueryResult> {
        let params: Vec<SqlParam<'_>> = args.iter().map(SqlParam).collect();
        let refs: Vec<&dyn tiberius::ToSql> =
            params.iter().map(|p| p as &dyn tiberius::ToSql).collect();

        let mut client = self.client.lock().await;
        let mut stream = client.query(query, &refs).await.map_err(|e| tds_error(&e))?;
        let schema = stream
            .columns()
            .await
            .map_err(|e| tds_error(&e))?
            .map(|columns| {
                Schema::new(
                    columns
                        .iter()
                        .map(|c| Field::new(c.name(), types::column_field_type(c.column_type())))
                        .collect(),
                )
            })
            .unwrap_or_default();
        let rows = stream
            .into_first_result()
            .await
            .map_err(|e| tds_error(&e))?
            .iter()
            .map(|row| {
                schema
                    .fields()
                    .iter()
                    .enumerate()
                    .map(|(i, f)| types::decode_cell(row, i, f.field_type))
                    .collect()
            })
            .collect();
        Ok(QueryResult { schema, rows })
    }

    async fn get_query_iterator(&self, query: &str) -> Result<Box<dyn RowIterator>> {
        let result = self.run_query(query, &[]).await?;
        Ok(Box::new(BufferedRows::from(result)))
    }
}

pub struct SynapseFactory;

#[async_trait]
impl ClientFactory for SynapseFactory {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Synapse
    }

    async fn connect(&self, config: &serde_json::Value) -> Result<Arc<dyn WarehouseClient>> {
        let config: SynapseConfig = parse_config(ConnectionType::Synapse, config)?;
        Ok(Arc::new(SynapseClient::connect(&config).await?))
    }
}
