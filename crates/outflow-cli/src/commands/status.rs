use std::path::Path;

use anyhow::Result;

use super::Workspace;

/// Execute the `status` command: print the stored cursor and recent runs.
pub async fn execute(manifest_path: &Path, sync: &str, limit: usize) -> Result<()> {
    let workspace = Workspace::load(manifest_path).await?;
    let sync_id = workspace.resolve_sync(sync).await?;
    let (config, runs) = workspace
        .blocking(move |store, org| {
            let config = store.load_sync_config(org, sync_id)?;
            let runs = store.list_runs(sync_id, limit)?;
            Ok((config, runs))
        })
        .await?;

    let definition = &config.sync;
    println!("Sync: {} (id {})", definition.name, definition.id);
    println!("  Workflow:  {}", definition.workflow_id);
    println!("  Mode:      {}", definition.sync_mode);
    println!(
        "  Every:     {} {}",
        definition.frequency, definition.frequency_units
    );
    println!(
        "  Cursor:    {}",
        definition.cursor_position.as_deref().unwrap_or("(none)")
    );

    if runs.is_empty() {
        println!("\nNo runs yet.");
        return Ok(());
    }
    println!("\nRecent runs:");
    for run in &runs {
        let finished = run
            .finished_at
            .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
        println!(
            "  {:>6}  {:<10} {:>10} rows  started {}  finished {}",
            run.id,
            run.status.as_str(),
            run.rows_written,
            run.started_at.to_rfc3339(),
            finished
        );
        if let Some(error) = &run.error {
            println!("          error: {error}");
        }
    }

    println!("@@RUNS_JSON@@{}", serde_json::to_string(&runs)?);
    Ok(())
}
