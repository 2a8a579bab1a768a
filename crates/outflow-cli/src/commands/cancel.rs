use std::path::Path;

use anyhow::Result;

use super::Workspace;

/// Execute the `cancel` command: move the sync's active run to `Cancelled`.
///
/// A worker still executing that run notices on its next lease heartbeat,
/// stops replicating, and discards its cursor.
pub async fn execute(manifest_path: &Path, sync: &str) -> Result<()> {
    let workspace = Workspace::load(manifest_path).await?;
    let sync_id = workspace.resolve_sync(sync).await?;
    let activities = workspace.activities();

    let Some(run) = activities.active_run(sync_id).await? else {
        println!("Sync '{sync}' has no active run.");
        return Ok(());
    };
    if activities.cleanup(run.id).await? {
        println!("Cancelled run {} of sync '{sync}'.", run.id);
    } else {
        println!("Run {} of sync '{sync}' had already finished.", run.id);
    }
    Ok(())
}
