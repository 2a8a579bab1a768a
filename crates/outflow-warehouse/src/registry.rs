//! Dialect dispatch: a [`Registry`] of [`ClientFactory`]s keyed by
//! [`ConnectionType`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use outflow_types::error::{ConnectorError, Result};
use outflow_types::model::{Connection, ConnectionType};
use serde::de::DeserializeOwned;

use crate::client::WarehouseClient;

/// Builds a client for one dialect from a connection's JSON config.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    fn connection_type(&self) -> ConnectionType;

    /// # Errors
    ///
    /// Returns a `config` error for an invalid config, or a transport error
    /// when the dialect connects eagerly.
    async fn connect(&self, config: &serde_json::Value) -> Result<Arc<dyn WarehouseClient>>;
}

/// Deserialize a dialect's typed config.
///
/// # Errors
///
/// Returns a `config` error naming the dialect and the serde failure.
pub fn parse_config<T: DeserializeOwned>(
    connection_type: ConnectionType,
    config: &serde_json::Value,
) -> Result<T> {
    serde_json::from_value(config.clone()).map_err(|e| {
        ConnectorError::config(
            "INVALID_CONNECTION_CONFIG",
            format!("{connection_type} config: {e}"),
        )
    })
}

/// Factory lookup by connection type.
#[derive(Default, Clone)]
pub struct Registry {
    factories: HashMap<ConnectionType, Arc<dyn ClientFactory>>,
}

impl Registry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in dialect.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::bigquery::BigQueryFactory));
        registry.register(Arc::new(crate::snowflake::SnowflakeFactory));
        registry.register(Arc::new(crate::redshift::RedshiftFactory));
        registry.register(Arc::new(crate::synapse::SynapseFactory));
        registry.register(Arc::new(crate::mongo::MongoFactory));
        registry.register(Arc::new(crate::webhook::WebhookFactory));
        registry
    }

    /// Add or replace the factory for its connection type.
    pub fn register(&mut self, factory: Arc<dyn ClientFactory>) {
        self.factories.insert(factory.connection_type(), factory);
    }

    #[must_use]
    pub fn contains(&self, connection_type: ConnectionType) -> bool {
        self.factories.contains_key(&connection_type)
    }

    /// Build a client for `connection`.
    ///
    /// # Errors
    ///
    /// Returns a `config` error when no factory is registered for the
    /// connection type, or whatever the factory reports.
    pub async fn connect(&self, connection: &Connection) -> Result<Arc<dyn WarehouseClient>> {
        let factory = self
            .factories
            .get(&connection.connection_type)
            .ok_or_else(|| {
                ConnectorError::config(
                    "UNKNOWN_CONNECTION_TYPE",
                    format!("no client registered for '{}'", connection.connection_type),
                )
            })?;
        tracing::debug!(
            connection = %connection.name,
            connection_type = %connection.connection_type,
            "Connecting warehouse client"
        );
        factory.connect(&connection.config).await
    }
}
