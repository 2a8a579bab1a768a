mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "outflow",
    version,
    about = "Reverse ETL: sync warehouse tables into customer destinations"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a manifest and save its definitions to the metadata store
    Apply {
        /// Path to manifest YAML file
        manifest: PathBuf,
    },
    /// Execute one sync now, with retries
    Run {
        /// Path to manifest YAML file
        manifest: PathBuf,
        /// Sync name
        #[arg(long)]
        sync: String,
    },
    /// Run every sync on its schedule until interrupted
    Schedule {
        /// Path to manifest YAML file
        manifest: PathBuf,
        /// Fire every sync once at startup
        #[arg(long)]
        run_now: bool,
    },
    /// Show the cursor and recent runs of a sync
    Status {
        /// Path to manifest YAML file
        manifest: PathBuf,
        /// Sync name
        #[arg(long)]
        sync: String,
        /// Number of runs to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Mark the active run of a sync as cancelled
    Cancel {
        /// Path to manifest YAML file
        manifest: PathBuf,
        /// Sync name
        #[arg(long)]
        sync: String,
    },
    /// Overwrite or clear the stored cursor of a sync
    ResetCursor {
        /// Path to manifest YAML file
        manifest: PathBuf,
        /// Sync name
        #[arg(long)]
        sync: String,
        /// New cursor literal; omit to re-read from the beginning
        #[arg(long)]
        position: Option<String>,
    },
    /// List namespaces, tables, or a table schema of a connection
    Discover {
        /// Path to manifest YAML file
        manifest: PathBuf,
        /// Connection name
        #[arg(long)]
        connection: String,
        #[arg(long)]
        namespace: Option<String>,
        /// Requires --namespace
        #[arg(long, requires = "namespace")]
        table: Option<String>,
    },
    /// Validate a manifest and test every connection
    Check {
        /// Path to manifest YAML file
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Apply { manifest } => commands::apply::execute(&manifest).await,
        Commands::Run { manifest, sync } => commands::run::execute(&manifest, &sync).await,
        Commands::Schedule { manifest, run_now } => {
            commands::schedule::execute(&manifest, run_now).await
        }
        Commands::Status {
            manifest,
            sync,
            limit,
        } => commands::status::execute(&manifest, &sync, limit).await,
        Commands::Cancel { manifest, sync } => commands::cancel::execute(&manifest, &sync).await,
        Commands::ResetCursor {
            manifest,
            sync,
            position,
        } => commands::reset_cursor::execute(&manifest, &sync, position).await,
        Commands::Discover {
            manifest,
            connection,
            namespace,
            table,
        } => {
            commands::discover::execute(
                &manifest,
                &connection,
                namespace.as_deref(),
                table.as_deref(),
            )
            .await
        }
        Commands::Check { manifest } => commands::check::execute(&manifest).await,
    }
}
