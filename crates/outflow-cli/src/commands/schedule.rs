use std::path::Path;

use anyhow::Result;
use outflow_engine::Scheduler;

use super::Workspace;

/// Execute the `schedule` command: run every applied sync of the
/// organization on its cadence until Ctrl-C.
pub async fn execute(manifest_path: &Path, run_now: bool) -> Result<()> {
    let workspace = Workspace::load(manifest_path).await?;
    let syncs = workspace
        .blocking(|store, org| Ok(store.list_syncs(org)?))
        .await?;
    if syncs.is_empty() {
        anyhow::bail!(
            "Organization '{}' has no syncs; run `outflow apply` first",
            workspace.org
        );
    }

    let scheduler = Scheduler::new(
        workspace.activities(),
        workspace.org.clone(),
        workspace.manifest.engine.retry_policy(),
    );
    for sync in &syncs {
        scheduler.schedule(sync)?;
        if run_now {
            scheduler.trigger_now(&sync.workflow_id)?;
        }
        println!(
            "Scheduled '{}' every {} {}",
            sync.name, sync.frequency, sync.frequency_units
        );
    }

    let mut reports = scheduler.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            match report.result {
                Ok(execution) => println!(
                    "[{}] {}: {} rows written",
                    report.qualifier, execution.status, execution.rows_written
                ),
                Err(error) => println!("[{}] error: {error}", report.qualifier),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, stopping scheduler");
    scheduler.shutdown().await;
    printer.abort();
    Ok(())
}
