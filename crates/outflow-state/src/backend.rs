//! Metadata store trait definition.
//!
//! [`MetadataStore`] defines the storage contract for sync definitions,
//! cursor positions, and the sync-run state machine. Model types live in
//! [`outflow_types::model`] and [`outflow_types::state`].

use std::time::Duration;

use outflow_types::model::{
    Connection, Destination, FieldMapping, FrequencyUnits, Object, Source, SyncConfig,
    SyncDefinition, SyncMode,
};
use outflow_types::state::{OrgId, RunClaim, RunId, RunOutcome, SyncId, SyncRun};

use crate::error;

/// A sync definition before it is assigned an id and workflow identifier.
///
/// `field_mappings` must already reference saved object field ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSync {
    pub name: String,
    pub source: String,
    pub object: String,
    pub end_customer_id: i64,
    pub sync_mode: SyncMode,
    pub source_cursor_field: Option<String>,
    pub frequency: u32,
    pub frequency_units: FrequencyUnits,
    pub custom_join: Option<String>,
    pub field_mappings: Vec<FieldMapping>,
}

/// Storage contract for definitions, cursors, and sync runs.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn MetadataStore>`. All methods block; async callers go through
/// `spawn_blocking`.
pub trait MetadataStore: Send + Sync {
    /// Insert or replace a connection, keyed by `(org, name)`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn put_connection(&self, org: &OrgId, connection: &Connection) -> error::Result<()>;

    /// Insert or replace a source, keyed by `(org, name)`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn put_source(&self, org: &OrgId, source: &Source) -> error::Result<()>;

    /// Insert or replace a destination, keyed by `(org, name)`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn put_destination(&self, org: &OrgId, destination: &Destination) -> error::Result<()>;

    /// Insert or replace an object and its fields.
    ///
    /// Field ids are stable across re-saves of a field with the same name.
    /// Returns the object with every field id assigned.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn put_object(&self, org: &OrgId, object: &Object) -> error::Result<Object>;

    /// Insert or replace a sync and its ordered field mappings.
    ///
    /// Re-saving an existing sync keeps its id, workflow id, and cursor.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn put_sync(&self, org: &OrgId, sync: &NewSync) -> error::Result<SyncId>;

    /// Look up a sync id by name.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn find_sync(&self, org: &OrgId, name: &str) -> error::Result<Option<SyncId>>;

    /// Every sync owned by `org`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_syncs(&self, org: &OrgId) -> error::Result<Vec<SyncDefinition>>;

    /// Resolve a sync together with its source, destination, object, and
    /// both connections.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`](crate::error::StateError::NotFound)
    /// when the sync or anything it references is missing.
    fn load_sync_config(&self, org: &OrgId, sync: SyncId) -> error::Result<SyncConfig>;

    /// Overwrite the stored cursor position of a sync.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn set_cursor(&self, sync: SyncId, position: Option<&str>) -> error::Result<()>;

    /// Return the active run of `sync`, or create a new `Started` one
    /// owned by `owner`.
    ///
    /// An active run whose heartbeat is older than `stale_after` is handed
    /// to `owner` ([`Lease::TakenOver`](outflow_types::state::Lease)); a
    /// live one is returned unchanged as [`Lease::Held`](outflow_types::state::Lease).
    /// The lookup, insert and takeover happen in one transaction and are
    /// backed by a partial unique index, so two callers never both own a run.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, sync: SyncId, owner: &str, stale_after: Duration)
        -> error::Result<RunClaim>;

    /// Refresh the heartbeat of an active run held by `owner`.
    ///
    /// Returns `false` when the run is terminal or another owner took it
    /// over.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn heartbeat_run(&self, run: RunId, owner: &str) -> error::Result<bool>;

    /// Move an active run to the outcome's terminal status.
    ///
    /// Returns `false` when the run was already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn finish_run(&self, run: RunId, outcome: &RunOutcome) -> error::Result<bool>;

    /// Mark an active run `Succeeded` and advance the sync cursor in one
    /// transaction. A `None` cursor leaves the stored position unchanged.
    ///
    /// Returns `false`, changing nothing, when the run was already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn commit_run(
        &self,
        run: RunId,
        rows_written: u64,
        cursor: Option<&str>,
    ) -> error::Result<bool>;

    /// Force an active run to `Cancelled`.
    ///
    /// Returns `false` when the run was already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn cancel_run(&self, run: RunId) -> error::Result<bool>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_run(&self, run: RunId) -> error::Result<Option<SyncRun>>;

    /// The `Queued` or `Started` run of `sync`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn active_run(&self, sync: SyncId) -> error::Result<Option<SyncRun>>;

    /// Most recent runs first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_runs(&self, sync: SyncId, limit: usize) -> error::Result<Vec<SyncRun>>;
}
