//! `PostgreSQL`-backed implementation of [`MetadataStore`].
//!
//! Uses the sync `postgres` crate with a single `Mutex<Client>` for
//! thread safety. The `postgres` crate manages its own internal tokio
//! runtime, so callers reach it through `spawn_blocking`.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use outflow_types::model::{
    Connection, Destination, Object, ObjectField, Source, SyncConfig, SyncDefinition,
};
use outflow_types::state::{
    Lease, ObjectFieldId, OrgId, RunClaim, RunId, RunOutcome, RunStatus, SyncId, SyncRun,
};
use postgres::types::ToSql;
use postgres::{Client, GenericClient, NoTls, Row};

use crate::backend::{MetadataStore, NewSync};
use crate::codec::{
    self, ConnectionRow, FieldRow, MappingRow, ObjectRow, RunRow, SyncRow, ACTIVE_STATUSES,
    FIELD_COLUMNS, MAPPING_COLUMNS, OBJECT_COLUMNS, RUN_COLUMNS, SYNC_COLUMNS,
};
use crate::error::{self, StateError};

/// Idempotent DDL for metadata tables (`PostgreSQL` dialect).
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS connections (
    id BIGSERIAL PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    connection_type TEXT NOT NULL,
    config TEXT NOT NULL,
    UNIQUE (org_id, name)
);

CREATE TABLE IF NOT EXISTS sources (
    id BIGSERIAL PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    connection_name TEXT NOT NULL,
    end_customer_id BIGINT NOT NULL,
    namespace TEXT,
    table_name TEXT,
    custom_join TEXT,
    UNIQUE (org_id, name)
);

CREATE TABLE IF NOT EXISTS destinations (
    id BIGSERIAL PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    connection_name TEXT NOT NULL,
    staging_bucket TEXT,
    UNIQUE (org_id, name)
);

CREATE TABLE IF NOT EXISTS objects (
    id BIGSERIAL PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    destination_name TEXT NOT NULL,
    namespace TEXT NOT NULL,
    table_name TEXT NOT NULL,
    end_customer_id_field TEXT NOT NULL,
    sync_mode TEXT NOT NULL,
    cursor_field TEXT,
    primary_key TEXT,
    frequency BIGINT NOT NULL,
    frequency_units TEXT NOT NULL,
    UNIQUE (org_id, name)
);

CREATE TABLE IF NOT EXISTS object_fields (
    id BIGSERIAL PRIMARY KEY,
    object_id BIGINT NOT NULL REFERENCES objects(id),
    name TEXT NOT NULL,
    field_type TEXT NOT NULL,
    display_name TEXT,
    description TEXT,
    nullable BOOLEAN NOT NULL,
    position BIGINT NOT NULL,
    UNIQUE (object_id, name)
);

CREATE TABLE IF NOT EXISTS syncs (
    id BIGSERIAL PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    source_name TEXT NOT NULL,
    object_name TEXT NOT NULL,
    end_customer_id BIGINT NOT NULL,
    sync_mode TEXT NOT NULL,
    source_cursor_field TEXT,
    cursor_position TEXT,
    frequency BIGINT NOT NULL,
    frequency_units TEXT NOT NULL,
    custom_join TEXT,
    workflow_id TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL,
    UNIQUE (org_id, name)
);

CREATE TABLE IF NOT EXISTS field_mappings (
    sync_id BIGINT NOT NULL REFERENCES syncs(id),
    position BIGINT NOT NULL,
    source_field_name TEXT NOT NULL,
    source_field_type TEXT NOT NULL,
    destination_field_id BIGINT NOT NULL,
    is_json_field BOOLEAN NOT NULL,
    PRIMARY KEY (sync_id, position)
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id BIGSERIAL PRIMARY KEY,
    sync_id BIGINT NOT NULL REFERENCES syncs(id),
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    rows_written BIGINT NOT NULL DEFAULT 0,
    error_message TEXT,
    cursor_before TEXT,
    cursor_after TEXT,
    owner TEXT,
    heartbeat_at TEXT
);

ALTER TABLE sync_runs ADD COLUMN IF NOT EXISTS owner TEXT;
ALTER TABLE sync_runs ADD COLUMN IF NOT EXISTS heartbeat_at TEXT;

CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_runs_active
    ON sync_runs (sync_id) WHERE status IN ('queued', 'started');
CREATE INDEX IF NOT EXISTS idx_sync_runs_sync ON sync_runs (sync_id, id);
";

/// `PostgreSQL`-backed metadata storage.
///
/// Create with [`PostgresMetadataStore::open`] providing a libpq-style
/// connection string (e.g. `"host=localhost dbname=outflow user=postgres"`).
pub struct PostgresMetadataStore {
    client: Mutex<Client>,
}

fn position(index: usize) -> i64 {
    i64::try_from(index).unwrap_or(i64::MAX)
}

fn run_row(row: &Row) -> RunRow {
    RunRow {
        id: row.get(0),
        sync_id: row.get(1),
        status: row.get(2),
        started_at: row.get(3),
        finished_at: row.get(4),
        rows_written: row.get(5),
        error: row.get(6),
        cursor_before: row.get(7),
        cursor_after: row.get(8),
    }
}

impl PostgresMetadataStore {
    /// Connect to a `PostgreSQL` database and initialize metadata tables.
    ///
    /// `connstr` is a libpq-style connection string or `PostgreSQL` URI:
    /// - `"host=localhost port=5432 dbname=outflow user=postgres"`
    /// - `"postgresql://postgres@localhost/outflow"`
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Postgres`] if connection or DDL execution fails.
    pub fn open(connstr: &str) -> error::Result<Self> {
        let mut client = Client::connect(connstr, NoTls)?;
        client.batch_execute(CREATE_TABLES)?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Acquire the client lock.
    fn lock_client(&self) -> error::Result<MutexGuard<'_, Client>> {
        self.client.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn active_run_in(client: &mut impl GenericClient, sync: SyncId) -> error::Result<Option<SyncRun>> {
        let rows = client.query(
            &format!(
                "SELECT {RUN_COLUMNS} FROM sync_runs \
                 WHERE sync_id = $1 AND status IN {ACTIVE_STATUSES}"
            ),
            &[&sync.get()],
        )?;
        rows.first().map(|row| run_row(row).into_run()).transpose()
    }

    fn connection_in(
        client: &mut impl GenericClient,
        org: &OrgId,
        name: &str,
    ) -> error::Result<Connection> {
        let row = client
            .query_opt(
                "SELECT name, connection_type, config FROM connections \
                 WHERE org_id = $1 AND name = $2",
                &[&org.as_str(), &name],
            )?
            .ok_or_else(|| StateError::not_found("connection", name))?;
        ConnectionRow {
            name: row.get(0),
            connection_type: row.get(1),
            config: row.get(2),
        }
        .into_connection()
    }

    fn source_in(client: &mut impl GenericClient, org: &OrgId, name: &str) -> error::Result<Source> {
        let row = client
            .query_opt(
                "SELECT name, connection_name, end_customer_id, namespace, table_name, custom_join \
                 FROM sources WHERE org_id = $1 AND name = $2",
                &[&org.as_str(), &name],
            )?
            .ok_or_else(|| StateError::not_found("source", name))?;
        Ok(Source {
            name: row.get(0),
            connection: row.get(1),
            end_customer_id: row.get(2),
            namespace: row.get(3),
            table_name: row.get(4),
            custom_join: row.get(5),
        })
    }

    fn destination_in(
        client: &mut impl GenericClient,
        org: &OrgId,
        name: &str,
    ) -> error::Result<Destination> {
        let row = client
            .query_opt(
                "SELECT name, connection_name, staging_bucket FROM destinations \
                 WHERE org_id = $1 AND name = $2",
                &[&org.as_str(), &name],
            )?
            .ok_or_else(|| StateError::not_found("destination", name))?;
        Ok(Destination {
            name: row.get(0),
            connection: row.get(1),
            staging_bucket: row.get(2),
        })
    }

    fn object_in(client: &mut impl GenericClient, org: &OrgId, name: &str) -> error::Result<Object> {
        let row = client
            .query_opt(
                &format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE org_id = $1 AND name = $2"),
                &[&org.as_str(), &name],
            )?
            .ok_or_else(|| StateError::not_found("object", name))?;
        let object = ObjectRow {
            id: row.get(0),
            name: row.get(1),
            destination: row.get(2),
            namespace: row.get(3),
            table_name: row.get(4),
            end_customer_id_field: row.get(5),
            sync_mode: row.get(6),
            cursor_field: row.get(7),
            primary_key: row.get(8),
            frequency: row.get(9),
            frequency_units: row.get(10),
        };

        let fields = client
            .query(
                &format!(
                    "SELECT {FIELD_COLUMNS} FROM object_fields \
                     WHERE object_id = $1 ORDER BY position"
                ),
                &[&object.id],
            )?
            .iter()
            .map(|r| {
                FieldRow {
                    id: r.get(0),
                    name: r.get(1),
                    field_type: r.get(2),
                    display_name: r.get(3),
                    description: r.get(4),
                    nullable: r.get(5),
                }
                .into_field()
            })
            .collect::<error::Result<Vec<ObjectField>>>()?;
        object.into_object(fields)
    }

    fn sync_rows(
        client: &mut impl GenericClient,
        filter: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> error::Result<Vec<SyncDefinition>> {
        let rows = client.query(
            &format!("SELECT {SYNC_COLUMNS} FROM syncs WHERE {filter} ORDER BY id"),
            params,
        )?;
        let mut syncs = Vec::with_capacity(rows.len());
        for row in &rows {
            let sync = SyncRow {
                id: row.get(0),
                org_id: row.get(1),
                name: row.get(2),
                source: row.get(3),
                object: row.get(4),
                end_customer_id: row.get(5),
                sync_mode: row.get(6),
                source_cursor_field: row.get(7),
                cursor_position: row.get(8),
                frequency: row.get(9),
                frequency_units: row.get(10),
                custom_join: row.get(11),
                workflow_id: row.get(12),
            };
            let mappings = client
                .query(
                    &format!(
                        "SELECT {MAPPING_COLUMNS} FROM field_mappings \
                         WHERE sync_id = $1 ORDER BY position"
                    ),
                    &[&sync.id],
                )?
                .iter()
                .map(|r| {
                    MappingRow {
                        source_field_name: r.get(0),
                        source_field_type: r.get(1),
                        destination_field_id: r.get(2),
                        is_json_field: r.get(3),
                    }
                    .into_mapping()
                })
                .collect::<error::Result<Vec<_>>>()?;
            syncs.push(sync.into_definition(mappings)?);
        }
        Ok(syncs)
    }

    /// Finish an active run; the caller owns the transaction.
    fn finish_in(
        client: &mut impl GenericClient,
        run: RunId,
        status: RunStatus,
        rows_written: Option<u64>,
        error_message: Option<&str>,
        cursor_after: Option<&str>,
    ) -> error::Result<bool> {
        let changed = client.execute(
            &format!(
                "UPDATE sync_runs SET status = $1, finished_at = $2, \
                 rows_written = COALESCE($3, rows_written), error_message = $4, \
                 cursor_after = $5 \
                 WHERE id = $6 AND status IN {ACTIVE_STATUSES}"
            ),
            &[
                &status.as_str(),
                &codec::now(),
                &rows_written.map(codec::rows_param),
                &error_message,
                &cursor_after,
                &run.get(),
            ],
        )?;
        Ok(changed > 0)
    }
}

impl MetadataStore for PostgresMetadataStore {
    fn put_connection(&self, org: &OrgId, connection: &Connection) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client.execute(
            "INSERT INTO connections (org_id, name, connection_type, config) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (org_id, name) \
             DO UPDATE SET connection_type = EXCLUDED.connection_type, config = EXCLUDED.config",
            &[
                &org.as_str(),
                &connection.name,
                &connection.connection_type.as_str(),
                &connection.config.to_string(),
            ],
        )?;
        Ok(())
    }

    fn put_source(&self, org: &OrgId, source: &Source) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client.execute(
            "INSERT INTO sources \
             (org_id, name, connection_name, end_customer_id, namespace, table_name, custom_join) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (org_id, name) \
             DO UPDATE SET connection_name = EXCLUDED.connection_name, \
             end_customer_id = EXCLUDED.end_customer_id, namespace = EXCLUDED.namespace, \
             table_name = EXCLUDED.table_name, custom_join = EXCLUDED.custom_join",
            &[
                &org.as_str(),
                &source.name,
                &source.connection,
                &source.end_customer_id,
                &source.namespace,
                &source.table_name,
                &source.custom_join,
            ],
        )?;
        Ok(())
    }

    fn put_destination(&self, org: &OrgId, destination: &Destination) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client.execute(
            "INSERT INTO destinations (org_id, name, connection_name, staging_bucket) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (org_id, name) \
             DO UPDATE SET connection_name = EXCLUDED.connection_name, \
             staging_bucket = EXCLUDED.staging_bucket",
            &[
                &org.as_str(),
                &destination.name,
                &destination.connection,
                &destination.staging_bucket,
            ],
        )?;
        Ok(())
    }

    fn put_object(&self, org: &OrgId, object: &Object) -> error::Result<Object> {
        let mut client = self.lock_client()?;
        let mut tx = client.transaction()?;
        let object_id: i64 = tx
            .query_one(
                "INSERT INTO objects \
                 (org_id, name, destination_name, namespace, table_name, end_customer_id_field, \
                  sync_mode, cursor_field, primary_key, frequency, frequency_units) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                 ON CONFLICT (org_id, name) \
                 DO UPDATE SET destination_name = EXCLUDED.destination_name, \
                 namespace = EXCLUDED.namespace, table_name = EXCLUDED.table_name, \
                 end_customer_id_field = EXCLUDED.end_customer_id_field, \
                 sync_mode = EXCLUDED.sync_mode, cursor_field = EXCLUDED.cursor_field, \
                 primary_key = EXCLUDED.primary_key, frequency = EXCLUDED.frequency, \
                 frequency_units = EXCLUDED.frequency_units \
                 RETURNING id",
                &[
                    &org.as_str(),
                    &object.name,
                    &object.destination,
                    &object.namespace,
                    &object.table_name,
                    &object.end_customer_id_field,
                    &object.sync_mode.as_str(),
                    &object.cursor_field,
                    &object.primary_key,
                    &i64::from(object.frequency),
                    &object.frequency_units.as_str(),
                ],
            )?
            .get(0);

        let mut saved = object.clone();
        let mut kept = Vec::with_capacity(saved.fields.len());
        for (index, field) in saved.fields.iter_mut().enumerate() {
            let id: i64 = tx
                .query_one(
                    "INSERT INTO object_fields \
                     (object_id, name, field_type, display_name, description, nullable, position) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) \
                     ON CONFLICT (object_id, name) \
                     DO UPDATE SET field_type = EXCLUDED.field_type, \
                     display_name = EXCLUDED.display_name, description = EXCLUDED.description, \
                     nullable = EXCLUDED.nullable, position = EXCLUDED.position \
                     RETURNING id",
                    &[
                        &object_id,
                        &field.name,
                        &field.field_type.as_str(),
                        &field.display_name,
                        &field.description,
                        &field.nullable,
                        &position(index),
                    ],
                )?
                .get(0);
            field.id = Some(ObjectFieldId::new(id));
            kept.push(id);
        }
        tx.execute(
            "DELETE FROM object_fields WHERE object_id = $1 AND NOT (id = ANY($2))",
            &[&object_id, &kept],
        )?;

        tx.commit()?;
        Ok(saved)
    }

    fn put_sync(&self, org: &OrgId, sync: &NewSync) -> error::Result<SyncId> {
        let mut client = self.lock_client()?;
        let mut tx = client.transaction()?;
        let id = SyncId::new(
            tx.query_one(
                "INSERT INTO syncs \
                 (org_id, name, source_name, object_name, end_customer_id, sync_mode, \
                  source_cursor_field, frequency, frequency_units, custom_join, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                 ON CONFLICT (org_id, name) \
                 DO UPDATE SET source_name = EXCLUDED.source_name, \
                 object_name = EXCLUDED.object_name, end_customer_id = EXCLUDED.end_customer_id, \
                 sync_mode = EXCLUDED.sync_mode, \
                 source_cursor_field = EXCLUDED.source_cursor_field, \
                 frequency = EXCLUDED.frequency, frequency_units = EXCLUDED.frequency_units, \
                 custom_join = EXCLUDED.custom_join, updated_at = EXCLUDED.updated_at \
                 RETURNING id",
                &[
                    &org.as_str(),
                    &sync.name,
                    &sync.source,
                    &sync.object,
                    &sync.end_customer_id,
                    &sync.sync_mode.as_str(),
                    &sync.source_cursor_field,
                    &i64::from(sync.frequency),
                    &sync.frequency_units.as_str(),
                    &sync.custom_join,
                    &codec::now(),
                ],
            )?
            .get(0),
        );
        tx.execute(
            "UPDATE syncs SET workflow_id = $1 WHERE id = $2",
            &[&codec::workflow_id(org, id), &id.get()],
        )?;

        tx.execute("DELETE FROM field_mappings WHERE sync_id = $1", &[&id.get()])?;
        for (index, mapping) in sync.field_mappings.iter().enumerate() {
            tx.execute(
                "INSERT INTO field_mappings \
                 (sync_id, position, source_field_name, source_field_type, \
                  destination_field_id, is_json_field) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &id.get(),
                    &position(index),
                    &mapping.source_field_name,
                    &mapping.source_field_type.as_str(),
                    &mapping.destination_field_id.get(),
                    &mapping.is_json_field,
                ],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    fn find_sync(&self, org: &OrgId, name: &str) -> error::Result<Option<SyncId>> {
        let mut client = self.lock_client()?;
        let row = client.query_opt(
            "SELECT id FROM syncs WHERE org_id = $1 AND name = $2",
            &[&org.as_str(), &name],
        )?;
        Ok(row.map(|r| SyncId::new(r.get(0))))
    }

    fn list_syncs(&self, org: &OrgId) -> error::Result<Vec<SyncDefinition>> {
        let mut client = self.lock_client()?;
        Self::sync_rows(&mut *client, "org_id = $1", &[&org.as_str()])
    }

    fn load_sync_config(&self, org: &OrgId, sync: SyncId) -> error::Result<SyncConfig> {
        let mut guard = self.lock_client()?;
        let client = &mut *guard;
        let sync = Self::sync_rows(
            client,
            "org_id = $1 AND id = $2",
            &[&org.as_str(), &sync.get()],
        )?
        .pop()
        .ok_or_else(|| StateError::not_found("sync", sync))?;
        let source = Self::source_in(client, org, &sync.source)?;
        let source_connection = Self::connection_in(client, org, &source.connection)?;
        let object = Self::object_in(client, org, &sync.object)?;
        let destination = Self::destination_in(client, org, &object.destination)?;
        let destination_connection = Self::connection_in(client, org, &destination.connection)?;
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
        let mut client = self.lock_client()?;
        let changed = client.execute(
            "UPDATE syncs SET cursor_position = $1, updated_at = $2 WHERE id = $3",
            &[&position, &codec::now(), &sync.get()],
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
        let mut client = self.lock_client()?;
        let mut tx = client.transaction()?;
        let now = chrono::Utc::now();

        let cursor_before: Option<String> = tx
            .query_opt("SELECT cursor_position FROM syncs WHERE id = $1", &[&sync.get()])?
            .ok_or_else(|| StateError::not_found("sync", sync))?
            .get(0);

        // A concurrent starter blocks on the active-run index until the other
        // transaction commits, then inserts nothing.
        let started_at = codec::ts(now);
        let inserted = tx.query_opt(
            &format!(
                "INSERT INTO sync_runs \
                 (sync_id, status, started_at, cursor_before, owner, heartbeat_at) \
                 VALUES ($1, $2, $3, $4, $5, $3) \
                 ON CONFLICT (sync_id) WHERE status IN {ACTIVE_STATUSES} DO NOTHING \
                 RETURNING {RUN_COLUMNS}"
            ),
            &[
                &sync.get(),
                &RunStatus::Started.as_str(),
                &started_at,
                &cursor_before,
                &owner,
            ],
        )?;
        if let Some(row) = inserted {
            let run = run_row(&row).into_run()?;
            tx.commit()?;
            return Ok(RunClaim {
                run,
                lease: Lease::Created,
            });
        }

        // Row lock so two callers cannot both take over a stale run.
        let row = tx
            .query_opt(
                &format!(
                    "SELECT {RUN_COLUMNS}, heartbeat_at FROM sync_runs \
                     WHERE sync_id = $1 AND status IN {ACTIVE_STATUSES} FOR UPDATE"
                ),
                &[&sync.get()],
            )?
            .ok_or_else(|| StateError::InvalidData(format!("active run of sync {sync} vanished")))?;
        let run = run_row(&row).into_run()?;
        let heartbeat: Option<String> = row.get(9);
        let lease = if codec::lease_expired(heartbeat.as_deref(), now, stale_after)? {
            tx.execute(
                "UPDATE sync_runs SET owner = $1, heartbeat_at = $2 WHERE id = $3",
                &[&owner, &started_at, &run.id.get()],
            )?;
            Lease::TakenOver
        } else {
            Lease::Held
        };
        tx.commit()?;
        Ok(RunClaim { run, lease })
    }

    fn heartbeat_run(&self, run: RunId, owner: &str) -> error::Result<bool> {
        let mut client = self.lock_client()?;
        let changed = client.execute(
            &format!(
                "UPDATE sync_runs SET heartbeat_at = $1 \
                 WHERE id = $2 AND owner = $3 AND status IN {ACTIVE_STATUSES}"
            ),
            &[&codec::now(), &run.get(), &owner],
        )?;
        Ok(changed > 0)
    }

    fn finish_run(&self, run: RunId, outcome: &RunOutcome) -> error::Result<bool> {
        let mut client = self.lock_client()?;
        Self::finish_in(
            &mut *client,
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
        let mut client = self.lock_client()?;
        let mut tx = client.transaction()?;
        if !Self::finish_in(
            &mut tx,
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
                "UPDATE syncs SET cursor_position = $1, updated_at = $2 \
                 WHERE id = (SELECT sync_id FROM sync_runs WHERE id = $3)",
                &[&position, &codec::now(), &run.get()],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn cancel_run(&self, run: RunId) -> error::Result<bool> {
        let mut client = self.lock_client()?;
        Self::finish_in(&mut *client, run, RunStatus::Cancelled, None, None, None)
    }

    fn get_run(&self, run: RunId) -> error::Result<Option<SyncRun>> {
        let mut client = self.lock_client()?;
        client
            .query_opt(
                &format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = $1"),
                &[&run.get()],
            )?
            .map(|row| run_row(&row).into_run())
            .transpose()
    }

    fn active_run(&self, sync: SyncId) -> error::Result<Option<SyncRun>> {
        let mut client = self.lock_client()?;
        Self::active_run_in(&mut *client, sync)
    }

    fn list_runs(&self, sync: SyncId, limit: usize) -> error::Result<Vec<SyncRun>> {
        let mut client = self.lock_client()?;
        client
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM sync_runs \
                     WHERE sync_id = $1 ORDER BY id DESC LIMIT $2"
                ),
                &[&sync.get(), &position(limit)],
            )?
            .iter()
            .map(|row| run_row(row).into_run())
            .collect()
    }
}
