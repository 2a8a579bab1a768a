use std::path::Path;

use anyhow::Result;
use outflow_warehouse::Registry;

use super::Workspace;

/// Execute the `check` command: validate the manifest, open the metadata
/// store, and check every connection.
pub async fn execute(manifest_path: &Path) -> Result<()> {
    let workspace = Workspace::load(manifest_path).await?;
    println!("Manifest structure: OK");
    println!("Metadata store:     OK");

    let registry = Registry::with_defaults();
    let mut failed = 0usize;
    for connection in &workspace.manifest.connections {
        let label = format!("{} ({}):", connection.name, connection.connection_type);
        let result = match registry.connect(connection).await {
            Ok(client) => client.check().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => println!("{label:30} OK"),
            Err(e) => {
                failed += 1;
                tracing::debug!(connection = %connection.name, error = %e, "Connection check failed");
                println!("{label:30} FAILED");
                println!("  {e}");
            }
        }
    }

    if failed == 0 {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("{failed} connection check(s) failed")
    }
}
