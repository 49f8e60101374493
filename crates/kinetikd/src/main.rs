//! kinetikd — the Kinetik daemon.
//!
//! Single binary that assembles the orchestrator:
//! - State store (redb)
//! - Resource ledger and scheduling policy
//! - Docker Engine runtime adapter
//! - Discovery, routing and forwarding registrars
//! - REST API
//!
//! # Usage
//!
//! ```text
//! kinetikd serve --config /etc/kinetik/kinetikd.toml --listen 0.0.0.0:10513
//! kinetikd check-config --config /etc/kinetik/kinetikd.toml
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use kinetik_core::DaemonConfig;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,kinetikd=debug,kinetik=debug";

#[derive(Parser)]
#[command(name = "kinetikd", about = "Kinetik cluster orchestrator daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator and its API.
    Serve {
        /// Path to the TOML config. A missing file means defaults.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `[server] listen`.
        #[arg(long)]
        listen: Option<String>,

        /// Override `[storage] data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Parse the config and print the resolved result.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            listen,
            data_dir,
        } => {
            let mut config = DaemonConfig::load(config.as_deref())?;
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(dir) = data_dir {
                config.storage.data_dir = dir.to_string_lossy().into_owned();
            }
            daemon::run(config).await
        }
        Command::CheckConfig { config } => {
            let config = DaemonConfig::load(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
