//! Manifest types deserialized from YAML.

use std::time::Duration;

use outflow_types::model::{Connection, Destination, FrequencyUnits, Object, Source, SyncMode};
use outflow_types::schema::FieldType;
use serde::{Deserialize, Serialize};

use crate::errors::RetryPolicy;
use crate::pipeline::PipelineOptions;
use crate::rate_limiter::RateLimitConfig;

/// Top-level manifest: one organization's definitions plus engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub organization: String,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    #[serde(default)]
    pub objects: Vec<Object>,
    #[serde(default)]
    pub syncs: Vec<SyncManifest>,
}

impl Manifest {
    #[must_use]
    pub fn connection(&self, name: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn source(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name == name)
    }

    #[must_use]
    pub fn destination(&self, name: &str) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.name == name)
    }

    #[must_use]
    pub fn object(&self, name: &str) -> Option<&Object> {
        self.objects.iter().find(|o| o.name == name)
    }

    #[must_use]
    pub fn sync(&self, name: &str) -> Option<&SyncManifest> {
        self.syncs.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
    Postgres,
}

/// Metadata store selection. `connection` is a file path for `SQLite` and a
/// connection string for `PostgreSQL`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    #[serde(default)]
    pub connection: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_batch_size")]
    pub read_batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub write_batch_size: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_activity_timeout_secs")]
    pub activity_timeout_secs: u64,
    #[serde(default = "default_run_lease_secs")]
    pub run_lease_secs: u64,
}

fn default_batch_size() -> usize {
    1_000
}
fn default_channel_capacity() -> usize {
    4
}
fn default_activity_timeout_secs() -> u64 {
    3_600
}
fn default_run_lease_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_batch_size: default_batch_size(),
            write_batch_size: default_batch_size(),
            channel_capacity: default_channel_capacity(),
            rate_limit: RateLimitSettings::default(),
            retry: RetrySettings::default(),
            activity_timeout_secs: default_activity_timeout_secs(),
            run_lease_secs: default_run_lease_secs(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            read_batch_size: self.read_batch_size.max(1),
            write_batch_size: self.write_batch_size.max(1),
            channel_capacity: self.channel_capacity.max(1),
            rate_limit: RateLimitConfig {
                requests_per_second: self.rate_limit.requests_per_second,
                burst: self.rate_limit.burst,
            },
            run_lease: Duration::from_secs(self.run_lease_secs.max(1)),
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.retry.initial_interval_ms),
            backoff_coefficient: self.retry.backoff_coefficient,
            max_interval: Duration::from_millis(self.retry.max_interval_ms),
            max_attempts: self.retry.max_attempts,
            activity_timeout: Duration::from_secs(self.activity_timeout_secs),
        }
    }
}

/// Destination flushes per second; `requests_per_second: 0` disables limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_requests_per_second() -> f64 {
    10.0
}
fn default_burst() -> u32 {
    10
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_interval_ms() -> u64 {
    1_000
}
fn default_backoff_coefficient() -> f64 {
    2.0
}
fn default_max_interval_ms() -> u64 {
    60_000
}
fn default_max_attempts() -> u32 {
    3
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            backoff_coefficient: default_backoff_coefficient(),
            max_interval_ms: default_max_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

// ---------------------------------------------------------------------------
// Syncs
// ---------------------------------------------------------------------------

/// A sync as written in the manifest.
///
/// Mode, cursor field and frequency fall back to the object's defaults;
/// `end_customer_id` and `custom_join` fall back to the source's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncManifest {
    pub name: String,
    pub source: String,
    pub object: String,
    #[serde(default)]
    pub end_customer_id: Option<i64>,
    #[serde(default)]
    pub sync_mode: Option<SyncMode>,
    #[serde(default)]
    pub cursor_field: Option<String>,
    #[serde(default)]
    pub frequency: Option<u32>,
    #[serde(default)]
    pub frequency_units: Option<FrequencyUnits>,
    #[serde(default)]
    pub custom_join: Option<String>,
    pub mappings: Vec<MappingManifest>,
}

impl SyncManifest {
    #[must_use]
    pub fn effective_mode(&self, object: &Object) -> SyncMode {
        self.sync_mode.unwrap_or(object.sync_mode)
    }

    #[must_use]
    pub fn effective_cursor_field<'a>(&'a self, object: &'a Object) -> Option<&'a str> {
        self.cursor_field
            .as_deref()
            .or(object.cursor_field.as_deref())
    }
}

/// One source column bound to a destination field by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingManifest {
    pub source_field: String,
    #[serde(default = "default_source_type")]
    pub source_type: FieldType,
    pub destination_field: String,
    #[serde(default)]
    pub is_json_field: bool,
}

fn default_source_type() -> FieldType {
    FieldType::String
}
