use std::path::Path;

use anyhow::Result;
use outflow_engine::config::apply;

use super::Workspace;

/// Execute the `apply` command: validate the manifest and upsert every
/// definition it contains.
pub async fn execute(manifest_path: &Path) -> Result<()> {
    let workspace = Workspace::load(manifest_path).await?;
    let manifest = workspace.manifest.clone();
    let summary = workspace
        .blocking(move |store, _| apply::apply_manifest(store, &manifest))
        .await?;

    tracing::info!(
        organization = %workspace.org,
        syncs = summary.syncs.len(),
        "Manifest applied"
    );
    println!("Manifest applied for organization '{}'.", workspace.org);
    println!("  Connections:  {}", summary.connections);
    println!("  Sources:      {}", summary.sources);
    println!("  Destinations: {}", summary.destinations);
    println!("  Objects:      {}", summary.objects);
    println!("  Syncs:        {}", summary.syncs.len());
    for (name, id) in &summary.syncs {
        println!("    - {name} (id {id})");
    }
    Ok(())
}
