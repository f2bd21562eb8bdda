//! CLI Entry Point for imu-daq
//!
//! Provides command-line interface for:
//! - Running a collection node (JSON commands on stdin, JSON status lines on stdout)
//! - Merging the parts of a captured session
//! - Decoding a merged session to CSV
//! - Listing sessions
//!
//! # Usage
//!
//! Run a node against simulated sensors:
//! ```bash
//! imu-daq node --config config/node.toml --simulate
//! ```
//!
//! Process a session collected from several nodes:
//! ```bash
//! imu-daq merge sessions/walk
//! imu-daq decode sessions/walk
//! imu-daq sessions sessions
//! ```
//!
//! Without a directory argument, `sessions` lists `storage.sessions_dir` from
//! `--config`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imu_daq::config::{NodeConfig, StorageConfig};
use imu_daq::hardware::mock::SimulatedBoard;
use imu_daq::hardware::BusProvider;
use imu_daq::logging::{self, LoggingConfig, OutputFormat};
use imu_daq::node::NodeService;
use imu_daq::session::{list_sessions, SessionStore};
use imu_daq::status::JsonLinesSink;
use imu_daq::transfer::LocalDirUploader;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "imu-daq")]
#[command(about = "Multi-node MPU-6050 data acquisition", long_about = None)]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a collection node: JSON commands on stdin, JSON status on stdout
    Node {
        /// Node configuration file
        #[arg(long, default_value = imu_daq::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Use simulated sensors (one per bus, at the first configured address)
        #[arg(long)]
        simulate: bool,
    },

    /// Merge the per-node parts of a session directory
    Merge {
        /// Session directory
        dir: PathBuf,
    },

    /// Decode a merged session into one CSV per sensor
    Decode {
        /// Session directory
        dir: PathBuf,
    },

    /// List the sessions under a directory
    Sessions {
        /// Sessions root [default: `storage.sessions_dir` of the node configuration]
        root: Option<PathBuf>,

        /// Node configuration consulted when no root is given
        #[arg(long, default_value = imu_daq::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Node { config, simulate } => run_node(config, simulate, cli.log_format).await,
        Commands::Merge { dir } => {
            init_tool_logging(cli.log_format)?;
            let merged = SessionStore::open(&dir)?.merge()?;
            println!(
                "Merged session \"{}\": {} device(s), {} aligned samples",
                merged.name,
                merged.devices.len(),
                merged.aligned_length()
            );
            Ok(())
        }
        Commands::Decode { dir } => {
            init_tool_logging(cli.log_format)?;
            for path in SessionStore::open(&dir)?.decode()? {
                println!("{}", path.display());
            }
            Ok(())
        }
        Commands::Sessions { root, config, json } => {
            init_tool_logging(cli.log_format)?;
            print_sessions(sessions_root(root, &config)?, json)
        }
    }
}

fn init_tool_logging(format: OutputFormat) -> Result<()> {
    logging::init(LoggingConfig::default().with_format(format))?;
    Ok(())
}

async fn run_node(config_path: PathBuf, simulate: bool, format: OutputFormat) -> Result<()> {
    let config = NodeConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;
    logging::init(LoggingConfig::from_node_config(&config)?.with_format(format))?;
    info!(device_id = %config.device_id, simulate, "starting node");

    if simulate {
        let address = config
            .i2c
            .addresses
            .first()
            .copied()
            .context("no I2C address configured")?;
        let locations: Vec<(u8, u8)> = config.i2c.buses.iter().map(|bus| (*bus, address)).collect();
        return serve(config, SimulatedBoard::with_sensors(&locations)).await;
    }

    #[cfg(feature = "hardware")]
    {
        serve(config, imu_daq::hardware::LinuxBusProvider).await
    }
    #[cfg(not(feature = "hardware"))]
    {
        anyhow::bail!("built without the `hardware` feature; run with --simulate")
    }
}

async fn serve<P: BusProvider>(config: NodeConfig, provider: P) -> Result<()> {
    let uploader = LocalDirUploader::new(
        config.transfer.sessions_root.clone(),
        config.transfer.base_url.clone(),
    );
    let sink = Arc::new(JsonLinesSink::new(std::io::stdout()));
    let service = NodeService::new(config, provider, sink, Box::new(uploader))?;
    service.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        service.handle_message(line);
    }

    if service.is_busy() {
        warn!("input closed while a command is running; waiting for it to finish");
    }
    tokio::task::spawn_blocking(move || service.shutdown()).await?;
    info!("node stopped");
    Ok(())
}

/// An explicit root wins; otherwise the configured `storage.sessions_dir`.
fn sessions_root(root: Option<PathBuf>, config_path: &Path) -> Result<PathBuf> {
    match root {
        Some(root) => Ok(root),
        None => {
            let storage = StorageConfig::load_from(config_path)
                .with_context(|| format!("loading {}", config_path.display()))?;
            Ok(storage.sessions_dir)
        }
    }
}

fn print_sessions(root: PathBuf, json: bool) -> Result<()> {
    let summaries = list_sessions(&root)
        .with_context(|| format!("listing sessions in {}", root.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:<8} {:>9} {:>8} {:>7} {:>7}",
        "NAME", "DATE", "TIME", "DURATION", "SENSORS", "MERGED", "DECODED"
    );
    for summary in summaries {
        println!(
            "{:<24} {:<10} {:<8} {:>9} {:>8} {:>7} {:>7}",
            summary.name,
            summary.date.as_deref().unwrap_or("-"),
            summary.time.as_deref().unwrap_or("-"),
            summary
                .duration
                .map_or_else(|| "-".to_string(), |d| format!("{d:.1}s")),
            summary.sensor_ids.len(),
            summary.merged,
            summary.decoded,
        );
    }
    Ok(())
}
