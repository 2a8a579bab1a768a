//! Conversions between stored column values and model types, shared by
//! both backends.

use std::time::Duration;

use chrono::{DateTime, Utc};
use outflow_types::model::{
    Connection, ConnectionType, FieldMapping, FrequencyUnits, Object, ObjectField, SyncDefinition,
    SyncMode,
};
use outflow_types::schema::FieldType;
use outflow_types::state::{ObjectFieldId, OrgId, RunId, RunStatus, SyncId, SyncRun};

use crate::error::{self, StateError};

/// SQL list of non-terminal statuses, used by the active-run index and by
/// conditional transitions.
pub(crate) const ACTIVE_STATUSES: &str = "('queued', 'started')";

pub(crate) fn now() -> String {
    ts(Utc::now())
}

pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

/// Whether a run lease last refreshed at `heartbeat` has lapsed by `now`.
///
/// A run without a heartbeat has no live owner.
pub(crate) fn lease_expired(
    heartbeat: Option<&str>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> error::Result<bool> {
    let Some(raw) = heartbeat else {
        return Ok(true);
    };
    let age = (now - parse_ts(raw)?).to_std().unwrap_or(Duration::ZERO);
    Ok(age >= stale_after)
}

pub(crate) fn parse_ts(raw: &str) -> error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StateError::InvalidData(format!("timestamp '{raw}': {e}")))
}

pub(crate) fn status(raw: &str) -> error::Result<RunStatus> {
    RunStatus::parse(raw).ok_or_else(|| StateError::InvalidData(format!("run status '{raw}'")))
}

pub(crate) fn sync_mode(raw: &str) -> error::Result<SyncMode> {
    SyncMode::parse(raw).ok_or_else(|| StateError::InvalidData(format!("sync mode '{raw}'")))
}

pub(crate) fn frequency_units(raw: &str) -> error::Result<FrequencyUnits> {
    FrequencyUnits::parse(raw)
        .ok_or_else(|| StateError::InvalidData(format!("frequency units '{raw}'")))
}

pub(crate) fn field_type(raw: &str) -> error::Result<FieldType> {
    FieldType::parse(raw).ok_or_else(|| StateError::InvalidData(format!("field type '{raw}'")))
}

pub(crate) fn frequency(raw: i64) -> error::Result<u32> {
    u32::try_from(raw).map_err(|_| StateError::InvalidData(format!("frequency {raw}")))
}

#[allow(clippy::cast_sign_loss)]
pub(crate) fn rows(raw: i64) -> u64 {
    raw.max(0) as u64
}

#[allow(clippy::cast_possible_wrap)]
pub(crate) fn rows_param(rows: u64) -> i64 {
    rows.min(i64::MAX as u64) as i64
}

/// Identifier handed to the scheduler for a sync.
pub(crate) fn workflow_id(org: &OrgId, sync: SyncId) -> String {
    format!("sync-{org}-{sync}")
}

/// Raw `sync_runs` columns in `RUN_COLUMNS` order.
pub(crate) struct RunRow {
    pub id: i64,
    pub sync_id: i64,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub rows_written: i64,
    pub error: Option<String>,
    pub cursor_before: Option<String>,
    pub cursor_after: Option<String>,
}

pub(crate) const RUN_COLUMNS: &str = "id, sync_id, status, started_at, finished_at, \
     rows_written, error_message, cursor_before, cursor_after";

impl RunRow {
    pub(crate) fn into_run(self) -> error::Result<SyncRun> {
        Ok(SyncRun {
            id: RunId::new(self.id),
            sync_id: SyncId::new(self.sync_id),
            status: status(&self.status)?,
            started_at: parse_ts(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            rows_written: rows(self.rows_written),
            error: self.error,
            cursor_before: self.cursor_before,
            cursor_after: self.cursor_after,
        })
    }
}

pub(crate) struct ConnectionRow {
    pub name: String,
    pub connection_type: String,
    pub config: String,
}

impl ConnectionRow {
    pub(crate) fn into_connection(self) -> error::Result<Connection> {
        let connection_type = ConnectionType::parse(&self.connection_type).ok_or_else(|| {
            StateError::InvalidData(format!("connection type '{}'", self.connection_type))
        })?;
        let config = serde_json::from_str(&self.config).map_err(|e| {
            StateError::InvalidData(format!("connection '{}' config: {e}", self.name))
        })?;
        Ok(Connection {
            name: self.name,
            connection_type,
            config,
        })
    }
}

pub(crate) const OBJECT_COLUMNS: &str = "id, name, destination_name, namespace, table_name, \
     end_customer_id_field, sync_mode, cursor_field, primary_key, frequency, frequency_units";

pub(crate) struct ObjectRow {
    pub id: i64,
    pub name: String,
    pub destination: String,
    pub namespace: String,
    pub table_name: String,
    pub end_customer_id_field: String,
    pub sync_mode: String,
    pub cursor_field: Option<String>,
    pub primary_key: Option<String>,
    pub frequency: i64,
    pub frequency_units: String,
}

impl ObjectRow {
    pub(crate) fn into_object(self, fields: Vec<ObjectField>) -> error::Result<Object> {
        Ok(Object {
            name: self.name,
            destination: self.destination,
            namespace: self.namespace,
            table_name: self.table_name,
            end_customer_id_field: self.end_customer_id_field,
            sync_mode: sync_mode(&self.sync_mode)?,
            cursor_field: self.cursor_field,
            primary_key: self.primary_key,
            frequency: frequency(self.frequency)?,
            frequency_units: frequency_units(&self.frequency_units)?,
            fields,
        })
    }
}

pub(crate) const FIELD_COLUMNS: &str =
    "id, name, field_type, display_name, description, nullable";

pub(crate) struct FieldRow {
    pub id: i64,
    pub name: String,
    pub field_type: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub nullable: bool,
}

impl FieldRow {
    pub(crate) fn into_field(self) -> error::Result<ObjectField> {
        Ok(ObjectField {
            id: Some(ObjectFieldId::new(self.id)),
            name: self.name,
            field_type: field_type(&self.field_type)?,
            display_name: self.display_name,
            description: self.description,
            nullable: self.nullable,
        })
    }
}

pub(crate) const MAPPING_COLUMNS: &str =
    "source_field_name, source_field_type, destination_field_id, is_json_field";

pub(crate) struct MappingRow {
    pub source_field_name: String,
    pub source_field_type: String,
    pub destination_field_id: i64,
    pub is_json_field: bool,
}

impl MappingRow {
    pub(crate) fn into_mapping(self) -> error::Result<FieldMapping> {
        Ok(FieldMapping {
            source_field_type: field_type(&self.source_field_type)?,
            source_field_name: self.source_field_name,
            destination_field_id: ObjectFieldId::new(self.destination_field_id),
            is_json_field: self.is_json_field,
        })
    }
}

pub(crate) const SYNC_COLUMNS: &str = "id, org_id, name, source_name, object_name, \
     end_customer_id, sync_mode, source_cursor_field, cursor_position, frequency, \
     frequency_units, custom_join, workflow_id";

pub(crate) struct SyncRow {
    pub id: i64,
    pub org_id: String,
    pub name: String,
    pub source: String,
    pub object: String,
    pub end_customer_id: i64,
    pub sync_mode: String,
    pub source_cursor_field: Option<String>,
    pub cursor_position: Option<String>,
    pub frequency: i64,
    pub frequency_units: String,
    pub custom_join: Option<String>,
    pub workflow_id: String,
}

impl SyncRow {
    pub(crate) fn into_definition(
        self,
        field_mappings: Vec<FieldMapping>,
    ) -> error::Result<SyncDefinition> {
        Ok(SyncDefinition {
            id: SyncId::new(self.id),
            org: OrgId::new(self.org_id),
            name: self.name,
            source: self.source,
            object: self.object,
            end_customer_id: self.end_customer_id,
            sync_mode: sync_mode(&self.sync_mode)?,
            source_cursor_field: self.source_cursor_field,
            cursor_position: self.cursor_position,
            frequency: frequency(self.frequency)?,
            frequency_units: frequency_units(&self.frequency_units)?,
            custom_join: self.custom_join,
            workflow_id: self.workflow_id,
            field_mappings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_id_is_stable() {
        assert_eq!(workflow_id(&OrgId::new("acme"), SyncId::new(3)), "sync-acme-3");
    }

    #[test]
    fn invalid_values_are_reported() {
        assert!(matches!(status("running"), Err(StateError::InvalidData(_))));
        assert!(matches!(parse_ts("yesterday"), Err(StateError::InvalidData(_))));
        assert!(frequency(-1).is_err());
    }

    #[test]
    fn connection_row_rejects_unknown_type() {
        let row = ConnectionRow {
            name: "wh".into(),
            connection_type: "oracle".into(),
            config: "{}".into(),
        };
        assert!(matches!(row.into_connection(), Err(StateError::InvalidData(_))));
    }

    #[test]
    fn lease_expiry() {
        let now = Utc::now();
        let recent = ts(now - chrono::Duration::seconds(5));
        let window = Duration::from_secs(30);
        assert!(!lease_expired(Some(&recent), now, window).unwrap());
        assert!(lease_expired(Some(&recent), now, Duration::from_secs(5)).unwrap());
        assert!(lease_expired(None, now, window).unwrap());
        // A heartbeat from a clock slightly ahead is treated as fresh.
        let ahead = ts(now + chrono::Duration::seconds(2));
        assert!(!lease_expired(Some(&ahead), now, window).unwrap());
    }

    #[test]
    fn rows_clamp_negative() {
        assert_eq!(rows(-5), 0);
        assert_eq!(rows_param(u64::MAX), i64::MAX);
    }
}
