pub mod apply;
pub mod cancel;
pub mod check;
pub mod discover;
pub mod reset_cursor;
pub mod run;
pub mod schedule;
pub mod status;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use outflow_engine::config::types::Manifest;
use outflow_engine::config::apply as manifest_store;
use outflow_engine::config::{parser, validator};
use outflow_engine::Activities;
use outflow_state::MetadataStore;
use outflow_types::state::{OrgId, SyncId};
use outflow_warehouse::Registry;

/// A validated manifest together with its opened metadata store.
pub(crate) struct Workspace {
    pub manifest: Manifest,
    pub store: Arc<dyn MetadataStore>,
    pub org: OrgId,
}

impl Workspace {
    /// Parse, validate, and open the manifest's metadata store.
    pub async fn load(manifest_path: &Path) -> Result<Self> {
        let manifest = parser::parse_manifest(manifest_path)
            .with_context(|| format!("Failed to parse manifest: {}", manifest_path.display()))?;
        validator::validate_manifest(&manifest)?;

        let state = manifest.state.clone();
        let store = tokio::task::spawn_blocking(move || manifest_store::open_store(&state))
            .await
            .context("Metadata store task failed")??;
        let org = OrgId::new(manifest.organization.as_str());
        Ok(Self {
            manifest,
            store,
            org,
        })
    }

    /// Run a blocking store call off the async runtime.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MetadataStore, &OrgId) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let org = self.org.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref(), &org))
            .await
            .context("Metadata store task failed")?
    }

    pub async fn resolve_sync(&self, name: &str) -> Result<SyncId> {
        let name = name.to_string();
        self.blocking(move |store, org| manifest_store::resolve_sync(store, org, &name))
            .await
    }

    pub fn activities(&self) -> Arc<Activities> {
        Arc::new(Activities::new(
            Arc::clone(&self.store),
            Registry::with_defaults(),
            self.manifest.engine.pipeline_options(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(db: &Path) -> String {
        format!(
            r#"
version: "1.0"
organization: acme
state:
  backend: sqlite
  connection: {}
connections:
  - name: snow
    type: snowflake
    config: {{}}
  - name: bq
    type: bigquery
    config: {{}}
sources:
  - name: warehouse
    connection: snow
    end_customer_id: 42
    namespace: analytics
    table: users
destinations:
  - name: crm
    connection: bq
    staging_bucket: outflow-staging
objects:
  - name: contacts
    destination: crm
    namespace: crm
    table: contacts
    end_customer_id_field: customer_id
    sync_mode: full_overwrite
    frequency: 1
    frequency_units: hours
    fields:
      - name: email
        type: string
syncs:
  - name: contacts-sync
    source: warehouse
    object: contacts
    mappings:
      - source_field: email
        destination_field: email
"#,
            db.display()
        )
    }

    #[tokio::test]
    async fn workspace_opens_store_and_resolves_applied_syncs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outflow.yaml");
        std::fs::write(&path, manifest(&dir.path().join("state.db"))).unwrap();

        apply::execute(&path).await.unwrap();
        let workspace = Workspace::load(&path).await.unwrap();
        assert_eq!(workspace.org.as_str(), "acme");
        assert!(workspace.resolve_sync("contacts-sync").await.is_ok());
        assert!(workspace.resolve_sync("missing").await.is_err());
    }
}
