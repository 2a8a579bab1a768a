use std::path::Path;

use anyhow::{Context, Result};
use outflow_warehouse::Registry;

use super::Workspace;

/// Execute the `discover` command: list namespaces, the tables of one
/// namespace, or the canonical schema of one table.
pub async fn execute(
    manifest_path: &Path,
    connection: &str,
    namespace: Option<&str>,
    table: Option<&str>,
) -> Result<()> {
    let workspace = Workspace::load(manifest_path).await?;
    let connection = workspace
        .manifest
        .connection(connection)
        .with_context(|| format!("Connection '{connection}' is not defined in the manifest"))?;
    let client = Registry::with_defaults()
        .connect(connection)
        .await
        .with_context(|| format!("Failed to connect to '{}'", connection.name))?;

    match (namespace, table) {
        (Some(ns), Some(table)) => {
            let schema = client.get_schema(ns, table).await?;
            println!("Table {ns}.{table}: {} column(s)\n", schema.len());
            for field in schema.fields() {
                println!("  - {} ({})", field.name, field.field_type);
            }
            println!("@@SCHEMA_JSON@@{}", serde_json::to_string(&schema)?);
        }
        (Some(ns), None) => {
            let tables = client.get_tables(ns).await?;
            println!("Namespace {ns}: {} table(s)\n", tables.len());
            for table in &tables {
                println!("  - {table}");
            }
        }
        _ => {
            let namespaces = client.get_namespaces().await?;
            println!("Discovered {} namespace(s):\n", namespaces.len());
            for ns in &namespaces {
                println!("  - {ns}");
            }
        }
    }
    Ok(())
}
