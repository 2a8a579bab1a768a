//! `SQLite`-backed implementation of [`MetadataStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use outflow_types::model::{
    Connection as WarehouseConnection, Destination, Object, ObjectField, Source, SyncConfig,
    SyncDefinition,
};
use outflow_types::state::{
    Lease, ObjectFieldId, OrgId, RunClaim, RunId, RunOutcome, RunStatus, SyncId, SyncRun,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::backend::{MetadataStore, NewSync};
use crate::codec::{
    self, ConnectionRow, FieldRow, MappingRow, ObjectRow, RunRow, SyncRow, ACTIVE_STATUSES,
    FIELD_COLUMNS, MAPPING_COLUMNS, OBJECT_COLUMNS, RUN_COLUMNS, SYNC_COLUMNS,
};
use crate::error::{self, StateError};

/// Idempotent DDL for metadata tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    connection_type TEXT NOT NULL,
    config TEXT NOT NULL,
    UNIQUE (org_id, name)
);

CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    connection_name TEXT NOT NULL,
    end_customer_id INTEGER NOT NULL,
    namespace TEXT,
    table_name TEXT,
    custom_join TEXT,
    UNIQUE (org_id, name)
);

CREATE TABLE IF NOT EXISTS destinations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    connection_name TEXT NOT NULL,
    staging_bucket TEXT,
    UNIQUE (org_id, name)
);

CREATE TABLE IF NOT EXISTS objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    destination_name TEXT NOT NULL,
    namespace TEXT NOT NULL,
    table_name TEXT NOT NULL,
    end_customer_id_field TEXT NOT NULL,
    sync_mode TEXT NOT NULL,
    cursor_field TEXT,
    primary_key TEXT,
    frequency INTEGER NOT NULL,
    frequency_units TEXT NOT NULL,
    UNIQUE (org_id, name)
);

CREATE TABLE IF NOT EXISTS object_fields (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    object_id INTEGER NOT NULL REFERENCES objects(id),
    name TEXT NOT NULL,
    field_type TEXT NOT NULL,
    display_name TEXT,
    description TEXT,
    nullable INTEGER NOT NULL,
    position INTEGER NOT NULL,
    UNIQUE (object_id, name)
);

CREATE TABLE IF NOT EXISTS syncs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    source_name TEXT NOT NULL,
    object_name TEXT NOT NULL,
    end_customer_id INTEGER NOT NULL,
    sync_mode TEXT NOT NULL,
    source_cursor_field TEXT,
    cursor_position TEXT,
    frequency INTEGER NOT NULL,
    frequency_units TEXT NOT NULL,
    custom_join TEXT,
    workflow_id TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL,
    UNIQUE (org_id, name)
);

CREATE TABLE IF NOT EXISTS field_mappings (
    sync_id INTEGER NOT NULL REFERENCES syncs(id),
    position INTEGER NOT NULL,
    source_field_name TEXT NOT NULL,
    source_field_type TEXT NOT NULL,
    destination_field_id INTEGER NOT NULL,
    is_json_field INTEGER NOT NULL,
    PRIMARY KEY (sync_id, position)
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sync_id INTEGER NOT NULL REFERENCES syncs(id),
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    rows_written INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    cursor_before TEXT,
    cursor_after TEXT,
    owner TEXT,
    heartbeat_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_runs_active
    ON sync_runs (sync_id) WHERE status IN ('queued', 'started');
CREATE INDEX IF NOT EXISTS idx_sync_runs_sync ON sync_runs (sync_id, id);
";

/// `SQLite`-backed metadata storage.
///
/// Create with [`SqliteMetadataStore::open`] for file-backed persistence
/// or [`SqliteMetadataStore::in_memory`] for tests.
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open or create a `SQLite` metadata database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the schema can't be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn read_run(row: &Row<'_>) -> rusqlite::Result<RunRow> {
        Ok(RunRow {
            id: row.get(0)?,
            sync_id: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            finished_at: row.get(4)?,
            rows_written: row.get(5)?,
            error: row.get(6)?,
            cursor_before: row.get(7)?,
            cursor_after: row.get(8)?,
        })
    }

    fn active_run_in(conn: &Connection, sync: SyncId) -> error::Result<Option<SyncRun>> {
        conn.query_row(
            &format!(
                "SELECT {RUN_COLUMNS} FROM sync_runs \
                 WHERE sync_id = ?1 AND status IN {ACTIVE_STATUSES}"
            ),
            [sync.get()],
            Self::read_run,
        )
        .optional()?
        .map(RunRow::into_run)
        .transpose()
    }

    /// The active run of `sync` with its raw heartbeat column.
    fn active_lease_in(
        conn: &Connection,
        sync: SyncId,
    ) -> error::Result<Option<(SyncRun, Option<String>)>> {
        conn.query_row(
            &format!(
                "SELECT {RUN_COLUMNS}, heartbeat_at FROM sync_runs \
                 WHERE sync_id = ?1 AND status IN {ACTIVE_STATUSES}"
            ),
            [sync.get()],
            |row| Ok((Self::read_run(row)?, row.get::<_, Option<String>>(9)?)),
        )
        .optional()?
        .map(|(run, heartbeat)| Ok((run.into_run()?, heartbeat)))
        .transpose()
    }

    fn connection_in(
        conn: &Connection,
        org: &OrgId,
        name: &str,
    ) -> error::Result<WarehouseConnection> {
        conn.query_row(
            "SELECT name, connection_type, config FROM connections \
             WHERE org_id = ?1 AND name = ?2",
            params![org.as_str(), name],
            |row| {
                Ok(ConnectionRow {
                    name: row.get(0)?,
                    connection_type: row.get(1)?,
                    config: row.get(2)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StateError::not_found("connection", name))?
        .into_connection()
    }

    fn source_in(conn: &Connection, org: &OrgId, name: &str) -> error::Result<Source> {
        conn.query_row(
            "SELECT name, connection_name, end_customer_id, namespace, table_name, custom_join \
             FROM sources WHERE org_id = ?1 AND name = ?2",
            params![org.as_str(), name],
            |row| {
                Ok(Source {
                    name: row.get(0)?,
                    connection: row.get(1)?,
                    end_customer_id: row.get(2)?,
                    namespace: row.get(3)?,
                    table_name: row.get(4)?,
                    custom_join: row.get(5)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StateError::not_found("source", name))
    }

    fn destination_in(conn: &Connection, org: &OrgId, name: &str) -> error::Result<Destination> {
        conn.query_row(
            "SELECT name, connection_name, staging_bucket FROM destinations \
             WHERE org_id = ?1 AND name = ?2",
            params![org.as_str(), name],
            |row| {
                Ok(Destination {
                    name: row.get(0)?,
                    connection: row.get(1)?,
                    staging_bucket: row.get(2)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StateError::not_found("destination", name))
    }

    fn object_in(conn: &Connection, org: &OrgId, name: &str) -> error::Result<Object> {
        let row = conn
            .query_row(
                &format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE org_id = ?1 AND name = ?2"),
                params![org.as_str(), name],
                |row| {
                    Ok(ObjectRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        destination: row.get(2)?,
                        namespace: row.get(3)?,
                        table_name: row.get(4)?,
                        end_customer_id_field: row.get(5)?,
                        sync_mode: row.get(6)?,
                        cursor_field: row.get(7)?,
                        primary_key: row.get(8)?,
                        frequency: row.get(9)?,
                        frequency_units: row.get(10)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StateError::not_found("object", name))?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {FIELD_COLUMNS} FROM object_fields WHERE object_id = ?1 ORDER BY position"
        ))?;
        let fields = stmt
            .query_map([row.id], |r| {
                Ok(FieldRow {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    field_type: r.get(2)?,
                    display_name: r.get(3)?,
                    description: r.get(4)?,
                    nullable: r.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(FieldRow::into_field)
            .collect::<error::Result<Vec<ObjectField>>>()?;
        row.into_object(fields)
    }

    fn sync_rows(
        conn: &Connection,
        filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> error::Result<Vec<SyncDefinition>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SYNC_COLUMNS} FROM syncs WHERE {filter} ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(SyncRow {
                    id: row.get(0)?,
                    org_id: row.get(1)?,
                    name: row.get(2)?,
                    source: row.get(3)?,
                    object: row.get(4)?,
                    end_customer_id: row.get(5)?,
                    sync_mode: row.get(6)?,
                    source_cursor_field: row.get(7)?,
                    cursor_position: row.get(8)?,
                    frequency: row.get(9)?,
                    frequency_units: row.get(10)?,
                    custom_join: row.get(11)?,
                    workflow_id: row.get(12)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut mapping_stmt = conn.prepare(&format!(
            "SELECT {MAPPING_COLUMNS} FROM field_mappings WHERE sync_id = ?1 ORDER BY position"
        ))?;
        let mut syncs = Vec::with_capacity(rows.len());
        for row in rows {
            let mappings = mapping_stmt
                .query_map([row.id], |r| {
                    Ok(MappingRow {
                        source_field_name: r.get(0)?,
                        source_field_type: r.get(1)?,
                        destination_field_id: r.get(2)?,
                        is_json_field: r.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .map(MappingRow::into_mapping)
                .collect::<error::Result<Vec<_>>>()?;
            syncs.push(row.into_definition(mappings)?);
        }
        Ok(syncs)
    }

    /// Finish an active run; the caller owns the transaction.
    fn finish_in(
        conn: &Connection,
        run: RunId,
        status: RunStatus,
        rows_written: Option<u64>,
        error_message: Option<&str>,
        cursor_after: Option<&str>,
    ) -> error::Result<bool> {
        let changed = conn.execute(
            &format!(
                "UPDATE sync_runs SET status = ?1, finished_at = ?2, \
                 rows_written = COALESCE(?3, rows_written), error_message = ?4, \
                 cursor_after = ?5 \
                 WHERE id = ?6 AND status IN {ACTIVE_STATUSES}"
            ),
            params![
                status.as_str(),
                codec::now(),
                rows_written.map(codec::rows_param),
                error_message,
                cursor_after,
                run.get(),
            ],
        )?;
        Ok(changed > 0)
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn put_connection(&self, org: &OrgId, connection: &WarehouseConnection) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO connections (org_id, name, connection_type, config) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(org_id, name) \
             DO UPDATE SET connection_type = ?3, config = ?4",
            params![
                org.as_str(),
                connection.name,
                connection.connection_type.as_str(),
                connection.config.to_string(),
            ],
        )?;
        Ok(())
    }

    fn put_source(&self, org: &OrgId, source: &Source) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sources \
             (org_id, name, connection_name, end_customer_id, namespace, table_name, custom_join) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(org_id, name) \
             DO UPDATE SET connection_name = ?3, end_customer_id = ?4, namespace = ?5, \
             table_name = ?6, custom_join = ?7",
            params![
                org.as_str(),
                source.name,
                source.connection,
                source.end_customer_id,
                source.namespace,
                source.table_name,
                source.custom_join,
            ],
        )?;
        Ok(())
    }

    fn put_destination(&self, org: &OrgId, destination: &Destination) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO destinations (org_id, name, connection_name, staging_bucket) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(org_id, name) \
             DO UPDATE SET connection_name = ?3, staging_bucket = ?4",
            params![
                org.as_str(),
                destination.name,
                destination.connection,
                destination.staging_bucket,
            ],
        )?;
        Ok(())
    }

    fn put_object(&self, org: &OrgId, object: &Object) -> error::Result<Object> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO objects \
             (org_id, name, destination_name, namespace, table_name, end_customer_id_field, \
              sync_mode, cursor_field, primary_key, frequency, frequency_units) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(org_id, name) \
             DO UPDATE SET destination_name = ?3, namespace = ?4, table_name = ?5, \
             end_customer_id_field = ?6, sync_mode = ?7, cursor_field = ?8, primary_key = ?9, \
             frequency = ?10, frequency_units = ?11",
            params![
                org.as_str(),
                object.name,
                object.destination,
                object.namespace,
                object.table_name,
                object.end_customer_id_field,
                object.sync_mode.as_str(),
                object.cursor_field,
                object.primary_key,
                object.frequency,
                object.frequency_units.as_str(),
            ],
        )?;
        let object_id: i64 = tx.query_row(
            "SELECT id FROM objects WHERE org_id = ?1 AND name = ?2",
            params![org.as_str(), object.name],
            |row| row.get(0),
        )?;

        let mut saved = object.clone();
        let mut kept = Vec::with_capacity(saved.fields.len());
        for (position, field) in saved.fields.iter_mut().enumerate() {
            tx.execute(
                "INSERT INTO object_fields \
                 (object_id, name, field_type, display_name, description, nullable, position) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(object_id, name) \
                 DO UPDATE SET field_type = ?3, display_name = ?4, description = ?5, \
                 nullable = ?6, position = ?7",
                params![
                    object_id,
                    field.name,
                    field.field_type.as_str(),
                    field.display_name,
                    field.description,
                    field.nullable,
                    i64::try_from(position).unwrap_or(i64::MAX),
                ],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM object_fields WHERE object_id = ?1 AND name = ?2",
                params![object_id, field.name],
                |row| row.get(0),
            )?;
            field.id = Some(ObjectFieldId::new(id));
            kept.push(id);
        }

        let existing: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT id FROM object_fields WHERE object_id = ?1")?;
            let ids = stmt
                .query_map([object_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            ids
        };
        for stale in existing.into_iter().filter(|id| !kept.contains(id)) {
            tx.execute("DELETE FROM object_fields WHERE id = ?1", [stale])?;
        }

        tx.commit()?;
        Ok(saved)
    }

    fn put_sync(&self, org: &OrgId, sync: &NewSync) -> error::Result<SyncId> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO syncs \
             (org_id, name, source_name, object_name, end_customer_id, sync_mode, \
              source_cursor_field, frequency, frequency_units, custom_join, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(org_id, name) \
             DO UPDATE SET source_name = ?3, object_name = ?4, end_customer_id = ?5, \
             sync_mode = ?6, source_cursor_field = ?7, frequency = ?8, frequency_units = ?9, \
             custom_join = ?10, updated_at = ?11",
            params![
                org.as_str(),
                sync.name,
                sync.source,
                sync.object,
                sync.end_customer_id,
                sync.sync_mode.as_str(),
                sync.source_cursor_field,
                sync.frequency,
                sync.frequency_units.as_str(),
                sync.custom_join,
                codec::now(),
            ],
        )?;
        let id = SyncId::new(tx.query_row(
            "SELECT id FROM syncs WHERE org_id = ?1 AND name = ?2",
            params![org.as_str(), sync.name],
            |row| row.get(0),
        )?);
        tx.execute(
            "UPDATE syncs SET workflow_id = ?1 WHERE id = ?2",
            params![codec::workflow_id(org, id), id.get()],
        )?;

        tx.execute("DELETE FROM field_mappings WHERE sync_id = ?1", [id.get()])?;
        for (position, mapping) in sync.field_mappings.iter().enumerate() {
            tx.execute(
                "INSERT INTO field_mappings \
                 (sync_id, position, source_field_name, source_field_type, \
                  destination_field_id, is_json_field) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.get(),
                    i64::try_from(position).unwrap_or(i64::MAX),
                    mapping.source_field_name,
                    mapping.source_field_type.as_str(),
                    mapping.destination_field_id.get(),
                    mapping.is_json_field,
                ],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    fn find_sync(&self, org: &OrgId, name: &str) -> error::Result<Option<SyncId>> {
        let conn = self.lock_conn()?;
        let id = conn
            .query_row(
                "SELECT id FROM syncs WHERE org_id = ?1 AND name = ?2",
                params![org.as_str(), name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id.map(SyncId::new))
    }

    fn list_syncs(&self, org: &OrgId) -> error::Result<Vec<SyncDefinition>> {
        let conn = self.lock_conn()?;
        Self::sync_rows(&conn, "org_id = ?1", &[&org.as_str()])
    }

    fn load_sync_config(&self, org: &OrgId, sync: SyncId) -> error::Result<SyncConfig> {
        let conn = self.lock_conn()?;
        let sync = Self::sync_rows(&conn, "org_id = ?1 AND id = ?2", &[&org.as_str(), &sync.get()])?
            .pop()
            .ok_or_else(|| StateError::not_found("sync", sync))?;
        let source = Self::source_in(&conn, org, &sync.source)?;
        let source_connection = Self::connection_in(&conn, org, &source.connection)?;
        let object = Self::object_in(&conn, org, &sync.object)?;
        let destination = Self::destination_in(&conn, org, &object.destination)?;
        let destination_connection = Self::connection_in(&conn, org, &destination.connection)?;
        Ok(SyncConfig {
            sync,
            source,
            source_connection,
            destination,
            destination_connection,
            object,
        })
    }

    fn set_cursor(&self, sync: SyncId, position: Option<&str>) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE syncs SET cursor_position = ?1, updated_at = ?2 WHERE id = ?3",
            params![position, codec::now(), sync.get()],
        )?;
        if changed == 0 {
            return Err(StateError::not_found("sync", sync));
        }
        Ok(())
    }

    fn start_run(
        &self,
        sync: SyncId,
        owner: &str,
        stale_after: Duration,
    ) -> error::Result<RunClaim> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = chrono::Utc::now();

        if let Some((run, heartbeat)) = Self::active_lease_in(&tx, sync)? {
            let lease = if codec::lease_expired(heartbeat.as_deref(), now, stale_after)? {
                tx.execute(
                    "UPDATE sync_runs SET owner = ?1, heartbeat_at = ?2 WHERE id = ?3",
                    params![owner, codec::ts(now), run.id.get()],
                )?;
                Lease::TakenOver
            } else {
                Lease::Held
            };
            tx.commit()?;
            return Ok(RunClaim { run, lease });
        }

        let cursor_before: Option<String> = tx
            .query_row(
                "SELECT cursor_position FROM syncs WHERE id = ?1",
                [sync.get()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StateError::not_found("sync", sync))?;

        let started_at = codec::ts(now);
        tx.execute(
            "INSERT INTO sync_runs \
             (sync_id, status, started_at, cursor_before, owner, heartbeat_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?3)",
            params![
                sync.get(),
                RunStatus::Started.as_str(),
                started_at,
                cursor_before,
                owner
            ],
        )?;
        let run_id = tx.last_insert_rowid();
        let run = tx
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = ?1"),
                [run_id],
                Self::read_run,
            )?
            .into_run()?;
        tx.commit()?;
        Ok(RunClaim {
            run,
            lease: Lease::Created,
        })
    }

    fn heartbeat_run(&self, run: RunId, owner: &str) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE sync_runs SET heartbeat_at = ?1 \
                 WHERE id = ?2 AND owner = ?3 AND status IN {ACTIVE_STATUSES}"
            ),
            params![codec::now(), run.get(), owner],
        )?;
        Ok(changed > 0)
    }

    fn finish_run(&self, run: RunId, outcome: &RunOutcome) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        Self::finish_in(
            &conn,
            run,
            outcome.status(),
            Some(outcome.rows_written()),
            outcome.error(),
            None,
        )
    }

    fn commit_run(
        &self,
        run: RunId,
        rows_written: u64,
        cursor: Option<&str>,
    ) -> error::Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !Self::finish_in(
            &tx,
            run,
            RunStatus::Succeeded,
            Some(rows_written),
            None,
            cursor,
        )? {
            return Ok(false);
        }
        if let Some(position) = cursor {
            tx.execute(
                "UPDATE syncs SET cursor_position = ?1, updated_at = ?2 \
                 WHERE id = (SELECT sync_id FROM sync_runs WHERE id = ?3)",
                params![position, codec::now(), run.get()],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn cancel_run(&self, run: RunId) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        Self::finish_in(&conn, run, RunStatus::Cancelled, None, None, None)
    }

    fn get_run(&self, run: RunId) -> error::Result<Option<SyncRun>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = ?1"),
            [run.get()],
            Self::read_run,
        )
        .optional()?
        .map(RunRow::into_run)
        .transpose()
    }

    fn active_run(&self, sync: SyncId) -> error::Result<Option<SyncRun>> {
        let conn = self.lock_conn()?;
        Self::active_run_in(&conn, sync)
    }

    fn list_runs(&self, sync: SyncId, limit: usize) -> error::Result<Vec<SyncRun>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE sync_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(
                params![sync.get(), i64::try_from(limit).unwrap_or(i64::MAX)],
                Self::read_run,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RunRow::into_run).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outflow_types::model::{FieldMapping, FrequencyUnits, SyncMode};
    use outflow_types::schema::FieldType;

    const LEASE: Duration = Duration::from_secs(60);

    fn org() -> OrgId {
        OrgId::new("acme")
    }

    fn start(store: &SqliteMetadataStore, sync: SyncId) -> SyncRun {
        store.start_run(sync, "worker-a", LEASE).unwrap().run
    }

    fn field(name: &str, field_type: FieldType) -> ObjectField {
        ObjectField {
            id: None,
            name: name.into(),
            field_type,
            display_name: None,
            description: None,
            nullable: true,
        }
    }

    fn object() -> Object {
        Object {
            name: "contacts".into(),
            destination: "dw".into(),
            namespace: "crm".into(),
            table_name: "contacts".into(),
            end_customer_id_field: "end_customer_id".into(),
            sync_mode: SyncMode::FullOverwrite,
            cursor_field: None,
            primary_key: Some("external_id".into()),
            frequency: 30,
            frequency_units: FrequencyUnits::Minutes,
            fields: vec![
                field("external_id", FieldType::Integer),
                field("name", FieldType::String),
            ],
        }
    }

    /// Store with a complete definition graph; returns the sync id.
    fn seeded() -> (SqliteMetadataStore, SyncId) {
        let store = SqliteMetadataStore::in_memory().unwrap();
        store
            .put_connection(
                &org(),
                &WarehouseConnection {
                    name: "wh".into(),
                    connection_type: outflow_types::model::ConnectionType::Redshift,
                    config: serde_json::json!({"host": "localhost"}),
                },
            )
            .unwrap();
        store
            .put_source(
                &org(),
                &Source {
                    name: "users".into(),
                    connection: "wh".into(),
                    end_customer_id: 9,
                    namespace: Some("public".into()),
                    table_name: Some("users".into()),
                    custom_join: None,
                },
            )
            .unwrap();
        store
            .put_destination(
                &org(),
                &Destination {
                    name: "dw".into(),
                    connection: "wh".into(),
                    staging_bucket: Some("bucket".into()),
                },
            )
            .unwrap();
        let saved = store.put_object(&org(), &object()).unwrap();
        let mappings = saved
            .fields
            .iter()
            .zip(["id", "name"])
            .map(|(f, source)| FieldMapping {
                source_field_name: source.into(),
                source_field_type: f.field_type,
                destination_field_id: f.id.unwrap(),
                is_json_field: false,
            })
            .collect();
        let id = store
            .put_sync(
                &org(),
                &NewSync {
                    name: "users_to_contacts".into(),
                    source: "users".into(),
                    object: "contacts".into(),
                    end_customer_id: 9,
                    sync_mode: SyncMode::FullOverwrite,
                    source_cursor_field: None,
                    frequency: 30,
                    frequency_units: FrequencyUnits::Minutes,
                    custom_join: None,
                    field_mappings: mappings,
                },
            )
            .unwrap();
        (store, id)
    }

    #[test]
    fn load_sync_config_resolves_graph() {
        let (store, id) = seeded();
        let config = store.load_sync_config(&org(), id).unwrap();
        assert_eq!(config.sync.name, "users_to_contacts");
        assert_eq!(config.sync.workflow_id, format!("sync-acme-{id}"));
        assert_eq!(config.source.table_name.as_deref(), Some("users"));
        assert_eq!(config.destination.staging_bucket.as_deref(), Some("bucket"));
        assert_eq!(config.object.fields.len(), 2);
        let names: Vec<_> = config
            .field_mappings()
            .iter()
            .map(|m| m.source_field_name.as_str())
            .collect();
        assert_eq!(names, ["id", "name"]);
        assert_eq!(
            config.object.field_by_id(config.field_mappings()[0].destination_field_id)
                .map(|f| f.name.as_str()),
            Some("external_id")
        );
    }

    #[test]
    fn missing_sync_is_not_found() {
        let (store, _) = seeded();
        let err = store.load_sync_config(&org(), SyncId::new(999)).unwrap_err();
        assert!(matches!(err, StateError::NotFound { kind: "sync", .. }));
    }

    #[test]
    fn object_field_ids_survive_resave() {
        let (store, _) = seeded();
        let first = store.put_object(&org(), &object()).unwrap();
        let second = store.put_object(&org(), &object()).unwrap();
        assert_eq!(first.fields[0].id, second.fields[0].id);
        assert_eq!(first.fields[1].id, second.fields[1].id);
    }

    #[test]
    fn resave_sync_keeps_id_and_cursor() {
        let (store, id) = seeded();
        store.set_cursor(id, Some("42")).unwrap();
        let config = store.load_sync_config(&org(), id).unwrap();
        let again = NewSync {
            name: config.sync.name.clone(),
            source: config.sync.source.clone(),
            object: config.sync.object.clone(),
            end_customer_id: 9,
            sync_mode: SyncMode::FullAppend,
            source_cursor_field: None,
            frequency: 1,
            frequency_units: FrequencyUnits::Hours,
            custom_join: None,
            field_mappings: config.sync.field_mappings.clone(),
        };
        assert_eq!(store.put_sync(&org(), &again).unwrap(), id);
        let reloaded = store.load_sync_config(&org(), id).unwrap();
        assert_eq!(reloaded.sync.cursor_position.as_deref(), Some("42"));
        assert_eq!(reloaded.sync.sync_mode, SyncMode::FullAppend);
    }

    #[test]
    fn start_run_is_idempotent_while_active() {
        let (store, id) = seeded();
        let first = store.start_run(id, "worker-a", LEASE).unwrap();
        let second = store.start_run(id, "worker-b", LEASE).unwrap();
        assert_eq!(first.lease, Lease::Created);
        assert_eq!(second.lease, Lease::Held);
        assert!(!second.is_owned());
        assert_eq!(first.run.id, second.run.id);
        assert_eq!(first.run.status, RunStatus::Started);
        // The holder keeps its lease; the other caller has none.
        assert!(store.heartbeat_run(first.run.id, "worker-a").unwrap());
        assert!(!store.heartbeat_run(first.run.id, "worker-b").unwrap());
    }

    #[test]
    fn stale_run_is_taken_over() {
        let (store, id) = seeded();
        let first = start(&store, id);
        {
            let conn = store.lock_conn().unwrap();
            conn.execute(
                "UPDATE sync_runs SET heartbeat_at = ?1 WHERE id = ?2",
                params![
                    codec::ts(chrono::Utc::now() - chrono::Duration::minutes(5)),
                    first.id.get()
                ],
            )
            .unwrap();
        }
        let claim = store.start_run(id, "worker-b", LEASE).unwrap();
        assert_eq!(claim.lease, Lease::TakenOver);
        assert_eq!(claim.run.id, first.id);
        assert!(store.heartbeat_run(first.id, "worker-b").unwrap());
        assert!(!store.heartbeat_run(first.id, "worker-a").unwrap());
        // The new owner's heartbeat is fresh, so a third caller waits.
        let third = store.start_run(id, "worker-c", LEASE).unwrap();
        assert_eq!(third.lease, Lease::Held);
    }

    #[test]
    fn heartbeat_stops_once_run_is_terminal() {
        let (store, id) = seeded();
        let run = start(&store, id);
        assert!(store.cancel_run(run.id).unwrap());
        assert!(!store.heartbeat_run(run.id, "worker-a").unwrap());
    }

    #[test]
    fn start_run_after_terminal_creates_new_run() {
        let (store, id) = seeded();
        let first = start(&store, id);
        assert!(store
            .finish_run(first.id, &RunOutcome::Succeeded { rows_written: 2 })
            .unwrap());
        let second = start(&store, id);
        assert_ne!(first.id, second.id);
        assert!(second.id > first.id);
    }

    #[test]
    fn start_run_unknown_sync_errors() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        assert!(matches!(
            store.start_run(SyncId::new(5), "worker-a", LEASE),
            Err(StateError::NotFound { .. })
        ));
    }

    #[test]
    fn partial_index_rejects_second_active_run() {
        let (store, id) = seeded();
        start(&store, id);
        let conn = store.lock_conn().unwrap();
        let err = conn
            .execute(
                "INSERT INTO sync_runs (sync_id, status, started_at) VALUES (?1, 'queued', ?2)",
                params![id.get(), codec::now()],
            )
            .unwrap_err();
        assert!(err.to_string().contains("UNIQUE"), "got: {err}");
    }

    #[test]
    fn terminal_transition_happens_once() {
        let (store, id) = seeded();
        let run = start(&store, id);
        let failed = RunOutcome::Failed {
            rows_written: 0,
            error: "connection reset".into(),
        };
        assert!(store.finish_run(run.id, &failed).unwrap());
        assert!(!store.cancel_run(run.id).unwrap());
        assert!(!store
            .finish_run(run.id, &RunOutcome::Succeeded { rows_written: 5 })
            .unwrap());

        let stored = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("connection reset"));
        assert!(stored.finished_at.is_some());
    }

    #[test]
    fn commit_run_advances_cursor_atomically() {
        let (store, id) = seeded();
        let run = start(&store, id);
        assert!(store.commit_run(run.id, 10, Some("'2024-01-02'")).unwrap());

        let config = store.load_sync_config(&org(), id).unwrap();
        assert_eq!(config.sync.cursor_position.as_deref(), Some("'2024-01-02'"));
        let stored = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert_eq!(stored.rows_written, 10);
        assert_eq!(stored.cursor_after.as_deref(), Some("'2024-01-02'"));

        let next = start(&store, id);
        assert_eq!(next.cursor_before.as_deref(), Some("'2024-01-02'"));
    }

    #[test]
    fn commit_on_cancelled_run_leaves_cursor() {
        let (store, id) = seeded();
        store.set_cursor(id, Some("5")).unwrap();
        let run = start(&store, id);
        assert!(store.cancel_run(run.id).unwrap());
        assert!(!store.commit_run(run.id, 3, Some("9")).unwrap());
        let config = store.load_sync_config(&org(), id).unwrap();
        assert_eq!(config.sync.cursor_position.as_deref(), Some("5"));
    }

    #[test]
    fn commit_without_cursor_keeps_position() {
        let (store, id) = seeded();
        store.set_cursor(id, Some("5")).unwrap();
        let run = start(&store, id);
        assert!(store.commit_run(run.id, 0, None).unwrap());
        let config = store.load_sync_config(&org(), id).unwrap();
        assert_eq!(config.sync.cursor_position.as_deref(), Some("5"));
    }

    #[test]
    fn list_runs_newest_first() {
        let (store, id) = seeded();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let run = start(&store, id);
            store.cancel_run(run.id).unwrap();
            ids.push(run.id);
        }
        let runs = store.list_runs(id, 2).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, ids[2]);
        assert_eq!(runs[1].id, ids[1]);
        assert!(store.active_run(id).unwrap().is_none());
    }

    #[test]
    fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("outflow.db");
        let store = SqliteMetadataStore::open(&path).unwrap();
        assert!(store.list_syncs(&org()).unwrap().is_empty());
        assert!(path.exists());
    }
}
