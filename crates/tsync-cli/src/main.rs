use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tsync_sync::SyncEnvironment;

#[derive(Debug, Parser)]
#[command(name = "tsync")]
#[command(about = "Incremental time-series sync into versioned Parquet artifacts")]
struct Cli {
    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, global = true, env = "TSYNC_LOG_JSON")]
    log_json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled dataset, or only the named one.
    Sync {
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Show staged chunks and stored versions.
    Status {
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Discard the staged chunks of one dataset type.
    ClearStaging {
        #[arg(long)]
        dataset: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let env = SyncEnvironment::from_env().await?;
    match cli.command.unwrap_or(Commands::Sync { dataset: None }) {
        Commands::Sync { dataset } => {
            let report = env.sync(dataset.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            let failed = report.failed();
            if failed > 0 {
                bail!("{failed} of {} dataset(s) failed", report.datasets.len());
            }
        }
        Commands::Status { dataset } => {
            let statuses = env.status(dataset.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        Commands::ClearStaging { dataset } => {
            env.clear_staging(&dataset).await?;
            info!(%dataset, "staging cleared");
        }
    }

    Ok(())
}
