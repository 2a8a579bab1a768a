//! Shared harness: an in-memory warehouse registered under the `redshift`
//! connection type, plus a manifest-backed SQLite store.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use outflow_engine::config::apply::apply_manifest;
use outflow_engine::config::parser::parse_manifest_str;
use outflow_engine::{Activities, PipelineOptions, RetryPolicy};
use outflow_state::{MetadataStore, SqliteMetadataStore};
use outflow_types::error::{ConnectorError, Result};
use outflow_types::model::ConnectionType;
use outflow_types::schema::{Field, FieldType, Row, Schema, Value};
use outflow_types::state::{OrgId, SyncId};
use outflow_warehouse::{
    ClientFactory, LoadMode, QueryResult, Registry, RowIterator, StagingClient, StagingOptions,
    WarehouseClient,
};
use regex::Regex;

pub const ORG: &str = "acme";
pub const SYNC: &str = "contacts-sync";

static SELECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^SELECT (?P<cols>.+?) FROM (?P<ns>\w+)\.(?P<table>\w+)(?: WHERE (?P<field>\w+) > (?P<after>\S+))?")
        .expect("valid regex")
});

/// Destination row: column name to raw CSV text.
pub type LoadedRow = BTreeMap<String, String>;

#[derive(Default)]
pub struct WarehouseState {
    pub tables: HashMap<String, (Schema, Vec<Row>)>,
    pub loaded: HashMap<String, Vec<LoadedRow>>,
    pub staged: HashMap<String, Bytes>,
    pub load_modes: Vec<LoadMode>,
    pub queries: Vec<String>,
    /// Errors returned by the next loads, in order.
    pub load_failures: VecDeque<ConnectorError>,
    pub row_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryWarehouse {
    pub state: Mutex<WarehouseState>,
}

impl MemoryWarehouse {
    pub fn with_users(rows: &[(i64, &str)]) -> Arc<Self> {
        let warehouse = Arc::new(Self::default());
        warehouse.insert_users(rows);
        warehouse
    }

    pub fn insert_users(&self, rows: &[(i64, &str)]) {
        let mut state = self.state.lock().unwrap();
        let (_, existing) = state.tables.entry("public.users".into()).or_insert_with(|| {
            (
                Schema::new(vec![
                    Field::new("id", FieldType::Integer),
                    Field::new("email", FieldType::String),
                ]),
                Vec::new(),
            )
        });
        existing.extend(
            rows.iter()
                .map(|(id, email)| vec![Value::Integer(*id), Value::String((*email).into())]),
        );
    }

    pub fn loaded(&self, table: &str) -> Vec<LoadedRow> {
        self.state
            .lock()
            .unwrap()
            .loaded
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn staged_count(&self) -> usize {
        self.state.lock().unwrap().staged.len()
    }

    pub fn fail_next_load(&self, err: ConnectorError) {
        self.state.lock().unwrap().load_failures.push_back(err);
    }

    pub fn set_row_delay(&self, delay: Duration) {
        self.state.lock().unwrap().row_delay = Some(delay);
    }

    fn evaluate(&self, query: &str) -> Result<(QueryResult, Option<Duration>)> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(query.to_string());
        let caps = SELECT_RE
            .captures(query)
            .ok_or_else(|| ConnectorError::data("BAD_QUERY", format!("unsupported: {query}")))?;
        let key = format!("{}.{}", &caps["ns"], &caps["table"]);
        let (schema, rows) = state
            .tables
            .get(&key)
            .ok_or_else(|| ConnectorError::schema("NO_TABLE", key.clone()))?;

        let columns: Vec<usize> = caps["cols"]
            .split(", ")
            .map(|c| {
                schema
                    .index_of(c)
                    .ok_or_else(|| ConnectorError::schema("NO_COLUMN", c.to_string()))
            })
            .collect::<Result<_>>()?;
        let filter = match (caps.name("field"), caps.name("after")) {
            (Some(field), Some(after)) => {
                let index = schema
                    .index_of(field.as_str())
                    .ok_or_else(|| ConnectorError::schema("NO_COLUMN", field.as_str().to_string()))?;
                let after: i64 = after
                    .as_str()
                    .parse()
                    .map_err(|_| ConnectorError::data("BAD_CURSOR", after.as_str().to_string()))?;
                Some((index, after))
            }
            _ => None,
        };

        let out_rows = rows
            .iter()
            .filter(|row| match filter {
                Some((index, after)) => matches!(row[index], Value::Integer(v) if v > after),
                None => true,
            })
            .map(|row| columns.iter().map(|&i| row[i].clone()).collect())
            .collect();
        let out_schema = Schema::new(
            columns
                .iter()
                .filter_map(|&i| schema.field(i).cloned())
                .collect(),
        );
        Ok((
            QueryResult {
                schema: out_schema,
                rows: out_rows,
            },
            state.row_delay,
        ))
    }
}

struct SlowRows {
    schema: Schema,
    rows: VecDeque<Row>,
    delay: Option<Duration>,
}

#[async_trait]
impl RowIterator for SlowRows {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn next_row(&mut self) -> Result<Option<Row>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.rows.pop_front())
    }
}

#[async_trait]
impl WarehouseClient for MemoryWarehouse {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Redshift
    }

    async fn get_namespaces(&self) -> Result<Vec<String>> {
        Ok(vec!["public".into()])
    }

    async fn get_tables(&self, _namespace: &str) -> Result<Vec<String>> {
        Ok(vec!["users".into()])
    }

    async fn get_schema(&self, namespace: &str, table: &str) -> Result<Schema> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(&format!("{namespace}.{table}"))
            .map(|(schema, _)| schema.clone())
            .ok_or_else(|| ConnectorError::schema("NO_TABLE", table.to_string()))
    }

    async fn run_query(&self, query: &str, _args: &[Value]) -> Result<QueryResult> {
        self.evaluate(query).map(|(result, _)| result)
    }

    async fn get_query_iterator(&self, query: &str) -> Result<Box<dyn RowIterator>> {
        let (result, delay) = self.evaluate(query)?;
        Ok(Box::new(SlowRows {
            schema: result.schema,
            rows: result.rows.into(),
            delay,
        }))
    }

    fn staging(&self) -> Option<&dyn StagingClient> {
        Some(self)
    }
}

#[async_trait]
impl StagingClient for MemoryWarehouse {
    async fn stage_data(&self, csv: Bytes, opts: &StagingOptions) -> Result<()> {
        let key = format!("{}/{}", opts.bucket, opts.object_key);
        self.state.lock().unwrap().staged.insert(key, csv);
        Ok(())
    }

    async fn load_from_staging(
        &self,
        namespace: &str,
        table: &str,
        opts: &StagingOptions,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.load_failures.pop_front() {
            return Err(err);
        }
        let key = format!("{}/{}", opts.bucket, opts.object_key);
        let csv = state
            .staged
            .get(&key)
            .cloned()
            .ok_or_else(|| ConnectorError::data("NOT_STAGED", key.clone()))?;

        let mut reader = csv::Reader::from_reader(&csv[..]);
        let headers = reader
            .headers()
            .map_err(|e| ConnectorError::data("BAD_CSV", e.to_string()))?
            .clone();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| ConnectorError::data("BAD_CSV", e.to_string()))?;
            rows.push(
                headers
                    .iter()
                    .zip(record.iter())
                    .map(|(h, v)| (h.to_string(), v.to_string()))
                    .collect(),
            );
        }

        state.load_modes.push(opts.load_mode);
        let target = state.loaded.entry(format!("{namespace}.{table}")).or_default();
        if opts.load_mode == LoadMode::Truncate {
            target.clear();
        }
        target.extend(rows);
        Ok(())
    }

    async fn clean_up_staging_data(&self, opts: &StagingOptions) -> Result<()> {
        let key = format!("{}/{}", opts.bucket, opts.object_key);
        self.state.lock().unwrap().staged.remove(&key);
        Ok(())
    }
}

struct MemoryFactory(Arc<MemoryWarehouse>);

#[async_trait]
impl ClientFactory for MemoryFactory {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Redshift
    }

    async fn connect(&self, _config: &serde_json::Value) -> Result<Arc<dyn WarehouseClient>> {
        let client: Arc<dyn WarehouseClient> = self.0.clone();
        Ok(client)
    }
}

/// Registry with the memory warehouse plus the real webhook client.
pub fn registry(warehouse: &Arc<MemoryWarehouse>) -> Registry {
    let mut registry = Registry::new();
    registry.register(Arc::new(MemoryFactory(Arc::clone(warehouse))));
    registry.register(Arc::new(outflow_warehouse::webhook::WebhookFactory));
    registry
}

/// Manifest syncing `public.users` into `crm.contacts` through staging.
pub fn staged_manifest(sync_mode: &str) -> String {
    format!(
        r#"
version: "1.0"
organization: {ORG}
connections:
  - name: source_wh
    type: redshift
  - name: dest_wh
    type: redshift
sources:
  - name: warehouse
    connection: source_wh
    end_customer_id: 42
    namespace: public
    table: users
destinations:
  - name: crm
    connection: dest_wh
    staging_bucket: outflow-staging
objects:
  - name: contacts
    destination: crm
    namespace: crm
    table: contacts
    end_customer_id_field: customer_id
    sync_mode: {sync_mode}
    cursor_field: id
    frequency: 1
    frequency_units: hours
    fields:
      - name: user_id
        type: integer
      - name: email
        type: string
syncs:
  - name: {SYNC}
    source: warehouse
    object: contacts
    mappings:
      - source_field: id
        source_type: integer
        destination_field: user_id
      - source_field: email
        destination_field: email
"#
    )
}

/// Short lease so tests can let a run go stale.
pub const RUN_LEASE: Duration = Duration::from_millis(300);

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_millis(5),
        backoff_coefficient: 2.0,
        max_interval: Duration::from_millis(20),
        max_attempts: 3,
        activity_timeout: Duration::from_secs(30),
    }
}

pub struct Harness {
    pub store: Arc<dyn MetadataStore>,
    pub activities: Arc<Activities>,
    pub warehouse: Arc<MemoryWarehouse>,
    pub org: OrgId,
    pub sync_id: SyncId,
}

impl Harness {
    pub fn new(manifest_yaml: &str, warehouse: Arc<MemoryWarehouse>) -> Self {
        let manifest = parse_manifest_str(manifest_yaml).unwrap();
        let store: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::in_memory().unwrap());
        let summary = apply_manifest(store.as_ref(), &manifest).unwrap();
        let options = PipelineOptions {
            read_batch_size: 2,
            write_batch_size: 2,
            channel_capacity: 1,
            run_lease: RUN_LEASE,
            ..PipelineOptions::default()
        };
        let activities = Arc::new(Activities::new(
            Arc::clone(&store),
            registry(&warehouse),
            options,
        ));
        Self {
            store,
            activities,
            warehouse,
            org: OrgId::new(ORG),
            sync_id: summary.syncs[0].1,
        }
    }

    pub fn stored_cursor(&self) -> Option<String> {
        self.store
            .load_sync_config(&self.org, self.sync_id)
            .unwrap()
            .sync
            .cursor_position
    }
}
