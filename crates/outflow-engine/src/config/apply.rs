//! Upsert manifest definitions into the metadata store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use outflow_state::{MetadataStore, NewSync, PostgresMetadataStore, SqliteMetadataStore};
use outflow_types::model::{FieldMapping, Object};
use outflow_types::state::{OrgId, SyncId};

use crate::config::types::{Manifest, StateBackendKind, StateConfig, SyncManifest};

const DEFAULT_SQLITE_PATH: &str = "outflow.db";

/// Open the configured metadata store.
///
/// Blocking: the `PostgreSQL` client drives its own runtime, so async callers
/// must go through `spawn_blocking`.
///
/// # Errors
///
/// Returns an error when the store cannot be opened or initialized.
pub fn open_store(state: &StateConfig) -> Result<Arc<dyn MetadataStore>> {
    match state.backend {
        StateBackendKind::Sqlite => {
            let path = state.connection.as_deref().unwrap_or(DEFAULT_SQLITE_PATH);
            let store = SqliteMetadataStore::open(Path::new(path))
                .with_context(|| format!("Failed to open SQLite metadata store at {path}"))?;
            Ok(Arc::new(store))
        }
        StateBackendKind::Postgres => {
            let connstr = state
                .connection
                .as_deref()
                .context("state.connection is required for the postgres backend")?;
            let store = PostgresMetadataStore::open(connstr)
                .context("Failed to open PostgreSQL metadata store")?;
            Ok(Arc::new(store))
        }
    }
}

/// Result of applying a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub connections: usize,
    pub sources: usize,
    pub destinations: usize,
    pub objects: usize,
    /// Sync names with their store ids, in manifest order.
    pub syncs: Vec<(String, SyncId)>,
}

fn new_sync(sync: &SyncManifest, manifest: &Manifest, object: &Object) -> Result<NewSync> {
    let source = manifest
        .source(&sync.source)
        .with_context(|| format!("Sync '{}' references unknown source", sync.name))?;
    let field_mappings = sync
        .mappings
        .iter()
        .map(|m| {
            let field_id = object
                .field_by_name(&m.destination_field)
                .and_then(|f| f.id)
                .with_context(|| {
                    format!(
                        "Sync '{}' maps to unknown field '{}'",
                        sync.name, m.destination_field
                    )
                })?;
            Ok(FieldMapping {
                source_field_name: m.source_field.clone(),
                source_field_type: m.source_type,
                destination_field_id: field_id,
                is_json_field: m.is_json_field,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(NewSync {
        name: sync.name.clone(),
        source: sync.source.clone(),
        object: sync.object.clone(),
        end_customer_id: sync.end_customer_id.unwrap_or(source.end_customer_id),
        sync_mode: sync.effective_mode(object),
        source_cursor_field: sync.effective_cursor_field(object).map(str::to_string),
        frequency: sync.frequency.unwrap_or(object.frequency),
        frequency_units: sync.frequency_units.unwrap_or(object.frequency_units),
        custom_join: sync.custom_join.clone(),
        field_mappings,
    })
}

/// Upsert every definition of a validated manifest.
///
/// Re-applying is idempotent: ids, workflow ids, and cursors of existing
/// syncs are preserved.
///
/// # Errors
///
/// Returns an error on the first storage failure or unresolved reference.
pub fn apply_manifest(store: &dyn MetadataStore, manifest: &Manifest) -> Result<ApplySummary> {
    let org = OrgId::new(manifest.organization.as_str());

    for connection in &manifest.connections {
        store
            .put_connection(&org, connection)
            .with_context(|| format!("Failed to save connection '{}'", connection.name))?;
    }
    for source in &manifest.sources {
        store
            .put_source(&org, source)
            .with_context(|| format!("Failed to save source '{}'", source.name))?;
    }
    for destination in &manifest.destinations {
        store
            .put_destination(&org, destination)
            .with_context(|| format!("Failed to save destination '{}'", destination.name))?;
    }

    let mut objects: HashMap<&str, Object> = HashMap::new();
    for object in &manifest.objects {
        let saved = store
            .put_object(&org, object)
            .with_context(|| format!("Failed to save object '{}'", object.name))?;
        objects.insert(object.name.as_str(), saved);
    }

    let mut syncs = Vec::with_capacity(manifest.syncs.len());
    for sync in &manifest.syncs {
        let object = objects
            .get(sync.object.as_str())
            .with_context(|| format!("Sync '{}' references unknown object", sync.name))?;
        let id = store
            .put_sync(&org, &new_sync(sync, manifest, object)?)
            .with_context(|| format!("Failed to save sync '{}'", sync.name))?;
        tracing::debug!(sync = %sync.name, sync_id = %id, "Applied sync");
        syncs.push((sync.name.clone(), id));
    }

    Ok(ApplySummary {
        connections: manifest.connections.len(),
        sources: manifest.sources.len(),
        destinations: manifest.destinations.len(),
        objects: manifest.objects.len(),
        syncs,
    })
}

/// Resolve a sync name to its store id.
///
/// # Errors
///
/// Returns an error when the lookup fails or the sync was never applied.
pub fn resolve_sync(store: &dyn MetadataStore, org: &OrgId, name: &str) -> Result<SyncId> {
    store
        .find_sync(org, name)
        .with_context(|| format!("Failed to look up sync '{name}'"))?
        .with_context(|| format!("Sync '{name}' not found; run `outflow apply` first"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_manifest_str;
    use outflow_types::model::SyncMode;

    const MANIFEST: &str = r#"
version: "1.0"
organization: acme
connections:
  - name: snow
    type: snowflake
    config: {account: xy12345}
  - name: hook
    type: webhook
    config: {url: "https://hooks.example.com"}
sources:
  - name: warehouse
    connection: snow
    end_customer_id: 42
    namespace: analytics
    table: users
destinations:
  - name: crm
    connection: hook
objects:
  - name: contacts
    destination: crm
    namespace: crm
    table: contacts
    end_customer_id_field: customer_id
    sync_mode: incremental_append
    cursor_field: id
    frequency: 15
    frequency_units: minutes
    fields:
      - name: email
        type: string
      - name: traits
        type: json
syncs:
  - name: contacts-sync
    source: warehouse
    object: contacts
    mappings:
      - source_field: email
        destination_field: email
      - source_field: plan
        source_type: string
        destination_field: traits
        is_json_field: true
"#;

    #[test]
    fn test_apply_resolves_defaults_and_field_ids() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let manifest = parse_manifest_str(MANIFEST).unwrap();
        let summary = apply_manifest(&store, &manifest).unwrap();
        assert_eq!(summary.connections, 2);
        assert_eq!(summary.syncs.len(), 1);

        let org = OrgId::new("acme");
        let id = resolve_sync(&store, &org, "contacts-sync").unwrap();
        assert_eq!(id, summary.syncs[0].1);

        let config = store.load_sync_config(&org, id).unwrap();
        assert_eq!(config.sync.end_customer_id, 42);
        assert_eq!(config.sync.sync_mode, SyncMode::IncrementalAppend);
        assert_eq!(config.sync.source_cursor_field.as_deref(), Some("id"));
        assert_eq!(config.sync.frequency, 15);
        let traits_id = config.object.field_by_name("traits").unwrap().id;
        assert_eq!(
            Some(config.sync.field_mappings[1].destination_field_id),
            traits_id
        );
    }

    #[test]
    fn test_reapply_keeps_sync_id() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let manifest = parse_manifest_str(MANIFEST).unwrap();
        let first = apply_manifest(&store, &manifest).unwrap();
        let second = apply_manifest(&store, &manifest).unwrap();
        assert_eq!(first.syncs, second.syncs);
    }

    #[test]
    fn test_resolve_unknown_sync() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let err = resolve_sync(&store, &OrgId::new("acme"), "missing")
            .unwrap_err()
            .to_string();
        assert!(err.contains("not found"));
    }
}
