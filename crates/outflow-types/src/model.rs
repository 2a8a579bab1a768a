//! Replication data model: connections, sources, destinations, objects,
//! field mappings, and syncs.
//!
//! These are the definitions a run reads; none of them is mutated while a
//! run is in flight except [`SyncDefinition::cursor_position`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::schema::FieldType;
use crate::state::{ObjectFieldId, OrgId, SyncId};

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Warehouse dialect tag, also the registry key for client factories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[serde(rename = "bigquery")]
    BigQuery,
    Snowflake,
    Redshift,
    Synapse,
    #[serde(rename = "mongodb")]
    MongoDb,
    Webhook,
}

impl ConnectionType {
    pub const ALL: [Self; 6] = [
        Self::BigQuery,
        Self::Snowflake,
        Self::Redshift,
        Self::Synapse,
        Self::MongoDb,
        Self::Webhook,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BigQuery => "bigquery",
            Self::Snowflake => "snowflake",
            Self::Redshift => "redshift",
            Self::Synapse => "synapse",
            Self::MongoDb => "mongodb",
            Self::Webhook => "webhook",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A warehouse credential set plus dialect-specific settings.
///
/// `config` is opaque at this layer; each dialect deserializes its own
/// typed configuration from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A connection scoped to one end customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub connection: String,
    pub end_customer_id: i64,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default, rename = "table")]
    pub table_name: Option<String>,
    #[serde(default)]
    pub custom_join: Option<String>,
}

/// A connection used for writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    pub connection: String,
    #[serde(default)]
    pub staging_bucket: Option<String>,
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// How rows land in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    FullOverwrite,
    FullAppend,
    IncrementalAppend,
    IncrementalUpdate,
}

impl SyncMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullOverwrite => "full_overwrite",
            Self::FullAppend => "full_append",
            Self::IncrementalAppend => "incremental_append",
            Self::IncrementalUpdate => "incremental_update",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::FullOverwrite,
            Self::FullAppend,
            Self::IncrementalAppend,
            Self::IncrementalUpdate,
        ]
        .into_iter()
        .find(|m| m.as_str() == raw)
    }

    /// Incremental modes read past a stored cursor position.
    #[must_use]
    pub fn uses_cursor(self) -> bool {
        matches!(self, Self::IncrementalAppend | Self::IncrementalUpdate)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyUnits {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl FrequencyUnits {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
            Self::Weeks => "weeks",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        [Self::Minutes, Self::Hours, Self::Days, Self::Weeks]
            .into_iter()
            .find(|u| u.as_str() == raw)
    }

    fn seconds(self) -> u64 {
        match self {
            Self::Minutes => 60,
            Self::Hours => 3_600,
            Self::Days => 86_400,
            Self::Weeks => 604_800,
        }
    }

    /// Schedule period for `frequency` of these units.
    #[must_use]
    pub fn period(self, frequency: u32) -> Duration {
        Duration::from_secs(self.seconds().saturating_mul(u64::from(frequency)))
    }
}

impl fmt::Display for FrequencyUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One destination column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectField {
    /// Assigned by the metadata store; `None` before the object is saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectFieldId>,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

/// Destination schema definition with per-sync defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub name: String,
    pub destination: String,
    pub namespace: String,
    #[serde(rename = "table")]
    pub table_name: String,
    pub end_customer_id_field: String,
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub cursor_field: Option<String>,
    #[serde(default)]
    pub primary_key: Option<String>,
    pub frequency: u32,
    pub frequency_units: FrequencyUnits,
    pub fields: Vec<ObjectField>,
}

impl Object {
    #[must_use]
    pub fn field_by_id(&self, id: ObjectFieldId) -> Option<&ObjectField> {
        self.fields.iter().find(|f| f.id == Some(id))
    }

    #[must_use]
    pub fn field_by_name(&self, name: &str) -> Option<&ObjectField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

// ---------------------------------------------------------------------------
// Syncs
// ---------------------------------------------------------------------------

/// Binds one source column to one destination field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field_name: String,
    pub source_field_type: FieldType,
    pub destination_field_id: ObjectFieldId,
    #[serde(default)]
    pub is_json_field: bool,
}

/// A persisted sync definition.
///
/// The order of `field_mappings` is the column order of generated queries
/// and of positional row decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDefinition {
    pub id: SyncId,
    pub org: OrgId,
    pub name: String,
    pub source: String,
    pub object: String,
    pub end_customer_id: i64,
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub source_cursor_field: Option<String>,
    #[serde(default)]
    pub cursor_position: Option<String>,
    pub frequency: u32,
    pub frequency_units: FrequencyUnits,
    #[serde(default)]
    pub custom_join: Option<String>,
    pub workflow_id: String,
    pub field_mappings: Vec<FieldMapping>,
}

impl SyncDefinition {
    #[must_use]
    pub fn period(&self) -> Duration {
        self.frequency_units.period(self.frequency)
    }
}

/// Everything a single replication needs, resolved from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub sync: SyncDefinition,
    pub source: Source,
    pub source_connection: Connection,
    pub destination: Destination,
    pub destination_connection: Connection,
    pub object: Object,
}

impl SyncConfig {
    #[must_use]
    pub fn field_mappings(&self) -> &[FieldMapping] {
        &self.sync.field_mappings
    }
}
