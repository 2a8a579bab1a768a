use std::path::Path;

use anyhow::Result;

use super::Workspace;

/// Execute the `reset-cursor` command: overwrite the stored cursor so the
/// next incremental run reads from `position` (or from the beginning).
pub async fn execute(manifest_path: &Path, sync: &str, position: Option<String>) -> Result<()> {
    let workspace = Workspace::load(manifest_path).await?;
    let sync_id = workspace.resolve_sync(sync).await?;
    let activities = workspace.activities();

    if let Some(run) = activities.active_run(sync_id).await? {
        anyhow::bail!(
            "Sync '{sync}' has an active run ({}); cancel it before resetting the cursor",
            run.id
        );
    }
    activities.update_cursor(sync_id, position.clone()).await?;
    match position {
        Some(p) => println!("Cursor of sync '{sync}' set to {p}."),
        None => println!("Cursor of sync '{sync}' cleared."),
    }
    Ok(())
}
