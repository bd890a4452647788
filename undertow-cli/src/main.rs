//! Undertow CLI - Command-line interface
//!
//! Streams a torrent's selected file, inspects torrent files and runs cache
//! sweeps against the engine's download directory.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "Streaming-aware BitTorrent engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    /// Directory for the trace-level log of this run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    /// JSON settings file; environment variables apply when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Download directory override
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let mut config = match &cli.config {
        Some(path) => undertow_core::UndertowConfig::from_json_file(path)?,
        None => undertow_core::UndertowConfig::from_env(),
    };
    if let Some(dir) = cli.download_dir {
        config.storage.download_dir = dir;
    }

    commands::handle_command(cli.command, config).await
}
