//! Orchestration activities: the units the retry loop and scheduler drive.
//!
//! Store access is blocking and always goes through `spawn_blocking`.

use std::sync::Arc;
use std::time::Duration;

use outflow_state::MetadataStore;
use outflow_types::error::ConnectorError;
use outflow_types::model::SyncConfig;
use outflow_types::state::{Lease, OrgId, RunClaim, RunId, RunOutcome, SyncId, SyncRun};
use outflow_warehouse::{CursorFilter, Registry, SelectQuery};
use tokio_util::sync::CancellationToken;

use crate::errors::SyncError;
use crate::pipeline::{self, PipelineOptions, ReadPlan, WritePlan};

/// Result of one successful replication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicateOutput {
    pub rows_read: u64,
    pub rows_written: u64,
    /// New cursor position; `None` keeps the stored one.
    pub cursor: Option<String>,
}

/// Dialect-neutral read for a sync: table or custom join, mapped columns in
/// order, and the cursor predicate for incremental modes.
///
/// # Errors
///
/// Returns a `config` error when an incremental sync has no cursor field.
pub fn build_select(config: &SyncConfig) -> Result<SelectQuery, ConnectorError> {
    let sync = &config.sync;
    let cursor = if sync.sync_mode.uses_cursor() {
        let field = sync.source_cursor_field.clone().ok_or_else(|| {
            ConnectorError::config(
                "CURSOR_FIELD_MISSING",
                format!("sync '{}' uses {} without a cursor field", sync.name, sync.sync_mode),
            )
        })?;
        Some(CursorFilter {
            field,
            after: sync.cursor_position.clone(),
        })
    } else {
        None
    };

    Ok(SelectQuery {
        namespace: config.source.namespace.clone(),
        table: config.source.table_name.clone(),
        custom_join: sync
            .custom_join
            .clone()
            .or_else(|| config.source.custom_join.clone()),
        columns: sync
            .field_mappings
            .iter()
            .map(|m| m.source_field_name.clone())
            .collect(),
        cursor,
    })
}

/// The activity implementations, bound to one store and client registry.
pub struct Activities {
    store: Arc<dyn MetadataStore>,
    registry: Registry,
    options: PipelineOptions,
}

impl Activities {
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>, registry: Registry, options: PipelineOptions) -> Self {
        Self {
            store,
            registry,
            options,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Heartbeat window after which an unrefreshed run may be taken over.
    #[must_use]
    pub fn run_lease(&self) -> Duration {
        self.options.run_lease
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MetadataStore) -> outflow_state::error::Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| SyncError::Infrastructure(anyhow::anyhow!("metadata store task failed: {e}")))?
            .map_err(SyncError::from)
    }

    /// Load the sync and everything it references.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] when the sync or a reference is missing.
    pub async fn fetch_config(&self, org: &OrgId, sync: SyncId) -> Result<SyncConfig, SyncError> {
        let org = org.clone();
        self.with_store(move |store| store.load_sync_config(&org, sync))
            .await
    }

    /// Return the sync's active run unchanged, or create a `Started` one
    /// owned by `owner`.
    ///
    /// An active run whose owner stopped heartbeating for longer than the
    /// run lease is handed to `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] on storage failure.
    pub async fn start_sync(
        &self,
        org: &OrgId,
        sync: SyncId,
        owner: &str,
    ) -> Result<RunClaim, SyncError> {
        let owner = owner.to_string();
        let lease = self.options.run_lease;
        let claim = self
            .with_store(move |store| store.start_run(sync, &owner, lease))
            .await?;
        let run_id = claim.run.id;
        match claim.lease {
            Lease::Created => {
                tracing::info!(org = %org, sync_id = %sync, run_id = %run_id, "Sync run started");
            }
            Lease::TakenOver => tracing::warn!(
                org = %org,
                sync_id = %sync,
                run_id = %run_id,
                "Took over a run whose execution stopped heartbeating"
            ),
            Lease::Held => tracing::info!(
                org = %org,
                sync_id = %sync,
                run_id = %run_id,
                "Sync run already held by a live execution"
            ),
        }
        Ok(claim)
    }

    /// Refresh `owner`'s lease on `run`. Returns `false` once the run is
    /// terminal or owned by someone else.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] on storage failure.
    pub async fn heartbeat(&self, run: RunId, owner: &str) -> Result<bool, SyncError> {
        let owner = owner.to_string();
        self.with_store(move |store| store.heartbeat_run(run, &owner))
            .await
    }

    /// Stream the source query into the destination.
    ///
    /// # Errors
    ///
    /// Returns the first connector or pipeline error, or
    /// [`SyncError::Cancelled`].
    pub async fn replicate(
        &self,
        config: &SyncConfig,
        run: &SyncRun,
        cancel: &CancellationToken,
    ) -> Result<ReplicateOutput, SyncError> {
        let source = self.registry.connect(&config.source_connection).await?;
        let destination = self.registry.connect(&config.destination_connection).await?;

        let select = build_select(config)?;
        let read_plan = ReadPlan {
            query: source.render_select(&select)?,
            cursor_field: select.cursor.as_ref().map(|c| c.field.clone()),
        };
        let write_plan = WritePlan {
            run_id: run.id,
            object: config.object.clone(),
            mappings: config.sync.field_mappings.clone(),
            end_customer_id: config.sync.end_customer_id,
            sync_mode: config.sync.sync_mode,
            staging_bucket: config.destination.staging_bucket.clone(),
            batch_size: self.options.write_batch_size,
        };
        tracing::debug!(
            sync_id = %config.sync.id,
            run_id = %run.id,
            query = %read_plan.query,
            "Replicating"
        );

        let output = pipeline::run_pipeline(
            source,
            destination,
            read_plan,
            write_plan,
            &self.options,
            cancel,
        )
        .await?;

        Ok(ReplicateOutput {
            rows_read: output.rows_read,
            rows_written: output.rows_written,
            cursor: output.cursor,
        })
    }

    /// Overwrite the stored cursor position of a sync.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] on storage failure.
    pub async fn update_cursor(&self, sync: SyncId, position: Option<String>) -> Result<(), SyncError> {
        self.with_store(move |store| store.set_cursor(sync, position.as_deref()))
            .await?;
        tracing::info!(sync_id = %sync, "Cursor updated");
        Ok(())
    }

    /// Move an active run to its terminal outcome.
    ///
    /// A success commits `cursor` in the same transaction, so the position
    /// only advances together with a `Succeeded` run. Returns `false` when
    /// the run was already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] on storage failure.
    pub async fn record_status(
        &self,
        run: RunId,
        outcome: RunOutcome,
        cursor: Option<String>,
    ) -> Result<bool, SyncError> {
        let status = outcome.status();
        let rows = outcome.rows_written();
        let changed = self
            .with_store(move |store| match outcome {
                RunOutcome::Succeeded { rows_written } => {
                    store.commit_run(run, rows_written, cursor.as_deref())
                }
                failed @ RunOutcome::Failed { .. } => store.finish_run(run, &failed),
            })
            .await?;
        if changed {
            tracing::info!(run_id = %run, status = %status, rows, "Recorded run status");
        } else {
            tracing::warn!(run_id = %run, status = %status, "Run was already terminal");
        }
        Ok(changed)
    }

    /// Force an active run to `Cancelled`. Returns `false` when it was
    /// already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] on storage failure.
    pub async fn cleanup(&self, run: RunId) -> Result<bool, SyncError> {
        let changed = self.with_store(move |store| store.cancel_run(run)).await?;
        if changed {
            tracing::info!(run_id = %run, "Run cancelled");
        }
        Ok(changed)
    }

    /// The sync's active run, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] on storage failure.
    pub async fn active_run(&self, sync: SyncId) -> Result<Option<SyncRun>, SyncError> {
        self.with_store(move |store| store.active_run(sync)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outflow_types::model::{
        Connection, ConnectionType, Destination, FieldMapping, FrequencyUnits, Object, Source,
        SyncDefinition, SyncMode,
    };
    use outflow_types::schema::FieldType;
    use outflow_types::state::ObjectFieldId;

    fn config(mode: SyncMode, cursor_field: Option<&str>, position: Option<&str>) -> SyncConfig {
        let connection = |name: &str, ty| Connection {
            name: name.into(),
            connection_type: ty,
            config: serde_json::Value::Null,
        };
        SyncConfig {
            sync: SyncDefinition {
                id: SyncId::new(1),
                org: OrgId::new("acme"),
                name: "s".into(),
                source: "src".into(),
                object: "obj".into(),
                end_customer_id: 9,
                sync_mode: mode,
                source_cursor_field: cursor_field.map(str::to_string),
                cursor_position: position.map(str::to_string),
                frequency: 1,
                frequency_units: FrequencyUnits::Hours,
                custom_join: None,
                workflow_id: "wf".into(),
                field_mappings: vec![
                    FieldMapping {
                        source_field_name: "id".into(),
                        source_field_type: FieldType::Integer,
                        destination_field_id: ObjectFieldId::new(1),
                        is_json_field: false,
                    },
                    FieldMapping {
                        source_field_name: "email".into(),
                        source_field_type: FieldType::String,
                        destination_field_id: ObjectFieldId::new(2),
                        is_json_field: false,
                    },
                ],
            },
            source: Source {
                name: "src".into(),
                connection: "rs".into(),
                end_customer_id: 9,
                namespace: Some("public".into()),
                table_name: Some("users".into()),
                custom_join: None,
            },
            source_connection: connection("rs", ConnectionType::Redshift),
            destination: Destination {
                name: "dst".into(),
                connection: "hook".into(),
                staging_bucket: None,
            },
            destination_connection: connection("hook", ConnectionType::Webhook),
            object: Object {
                name: "obj".into(),
                destination: "dst".into(),
                namespace: "crm".into(),
                table_name: "contacts".into(),
                end_customer_id_field: "customer_id".into(),
                sync_mode: mode,
                cursor_field: None,
                primary_key: None,
                frequency: 1,
                frequency_units: FrequencyUnits::Hours,
                fields: vec![],
            },
        }
    }

    #[test]
    fn test_full_mode_select_has_no_cursor() {
        let select = build_select(&config(SyncMode::FullOverwrite, Some("id"), Some("5"))).unwrap();
        assert!(select.cursor.is_none());
        assert_eq!(select.to_sql().unwrap(), "SELECT id, email FROM public.users");
    }

    #[test]
    fn test_incremental_select_uses_stored_position() {
        let select =
            build_select(&config(SyncMode::IncrementalAppend, Some("id"), Some("5"))).unwrap();
        assert_eq!(
            select.to_sql().unwrap(),
            "SELECT id, email FROM public.users WHERE id > 5 ORDER BY id ASC"
        );
    }

    #[test]
    fn test_incremental_without_cursor_field_is_config_error() {
        let err = build_select(&config(SyncMode::IncrementalUpdate, None, None)).unwrap_err();
        assert_eq!(err.code, "CURSOR_FIELD_MISSING");
    }

    #[test]
    fn test_sync_custom_join_overrides_source() {
        let mut cfg = config(SyncMode::FullAppend, None, None);
        cfg.source.custom_join = Some("SELECT 1 AS id".into());
        assert_eq!(build_select(&cfg).unwrap().to_sql().unwrap(), "SELECT 1 AS id");
        cfg.sync.custom_join = Some("SELECT 2 AS id".into());
        assert_eq!(build_select(&cfg).unwrap().to_sql().unwrap(), "SELECT 2 AS id");
    }
}
