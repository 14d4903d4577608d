mod api;
mod automations;
mod config;
mod node;
mod outbox;
mod snapshot;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::node::Monitor;

/// Monitoring and control plane for a Meshtastic mesh network.
#[derive(Parser, Debug)]
#[command(name = "meshmonitord", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "MESHMONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (database, caches)
    #[arg(short, long, env = "MESHMONITOR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Write a default configuration file and exit
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init {
        let config = Config::create_default(args.config, args.data_dir)?;
        println!("Wrote default configuration to {}", config.config_path().display());
        return Ok(());
    }

    let config = Config::load(args.config, args.data_dir)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    // The non-blocking writer stops flushing once its guard drops, so the
    // guard lives for the whole run.
    let _log_guard = match &config.logging.file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let dir = dir.unwrap_or_else(|| std::path::Path::new("."));
            std::fs::create_dir_all(dir)?;
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Log file path has no file name"))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    };

    let mut monitor = Monitor::new(config).await?;
    monitor.run().await
}
