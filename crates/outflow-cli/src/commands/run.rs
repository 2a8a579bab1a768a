use std::path::Path;

use anyhow::{Context, Result};
use outflow_engine::execute_sync;
use outflow_types::state::RunStatus;
use tokio_util::sync::CancellationToken;

use super::Workspace;

/// Execute the `run` command: one sync execution through the retrying
/// workflow. Ctrl-C cancels the run.
pub async fn execute(manifest_path: &Path, sync: &str) -> Result<()> {
    let workspace = Workspace::load(manifest_path).await?;
    let sync_id = workspace.resolve_sync(sync).await?;
    let activities = workspace.activities();
    let policy = workspace.manifest.engine.retry_policy();

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling sync");
                cancel.cancel();
            }
        })
    };

    let result = execute_sync(&activities, &workspace.org, sync_id, &policy, &cancel).await;
    interrupt.abort();
    let execution = result.with_context(|| format!("Sync '{sync}' could not be executed"))?;

    println!("Sync '{sync}' finished: {}", execution.status);
    println!("  Run id:          {}", execution.run_id);
    println!("  Rows read:       {}", execution.rows_read);
    println!("  Rows written:    {}", execution.rows_written);
    if let Some(cursor) = &execution.cursor {
        println!("  Cursor:          {cursor}");
    }
    println!("  Attempts:        {}", execution.attempts);
    println!("  Duration:        {:.2}s", execution.duration_secs);
    if execution.duration_secs > 0.0 && execution.rows_written > 0 {
        #[allow(clippy::cast_precision_loss)]
        let throughput = execution.rows_written as f64 / execution.duration_secs;
        println!("  Throughput:      {throughput:.0} rows/sec");
    }
    if let Some(error) = &execution.error {
        println!("  Error:           {error}");
    }

    // Machine-readable summary for wrappers
    println!("@@SYNC_JSON@@{}", serde_json::to_string(&execution)?);

    if execution.status == RunStatus::Succeeded {
        Ok(())
    } else {
        anyhow::bail!("Sync '{sync}' ended {}", execution.status)
    }
}
