//! Plansync server binary.
//!
//! # Usage
//!
//! ```bash
//! # Serve line-delimited JSON events on stdin, messages on stdout
//! plansync-server --checkpoint-dir /var/lib/plansync
//!
//! # Smaller undo sets, checksum every 5th transmission
//! plansync-server --undo-threshold-ms 1000 --checksum-every 5
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use plansync_core::{ChecksumConfig, RegistryConfig, ScenarioConfig, UndoConfig};
use plansync_server::{DriverConfig, Server, ServerRuntimeConfig, run_stdio};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Plansync scenario server
#[derive(Parser, Debug)]
#[command(name = "plansync-server")]
#[command(about = "Multi-user production scheduling scenario server")]
#[command(version)]
struct Args {
    /// Directory holding undo checkpoints
    #[arg(long, default_value = "./checkpoints")]
    checkpoint_dir: PathBuf,

    /// Name of the production scenario created on first start
    #[arg(long, default_value = "Live")]
    scenario_name: String,

    /// Processing time that closes an undo set, in milliseconds
    #[arg(long, default_value = "5000")]
    undo_threshold_ms: u64,

    /// Undo memory ceiling per scenario, in megabytes
    #[arg(long, default_value = "256")]
    memory_limit_mb: u64,

    /// Fingerprint every Nth transmission (0 disables cadence)
    #[arg(long, default_value = "10")]
    checksum_every: u64,

    /// Attach recent transmissions to every fingerprint
    #[arg(long)]
    diagnostics: bool,

    /// Maximum loaded scenarios
    #[arg(long, default_value = "64")]
    max_scenarios: usize,

    /// Maximum concurrent sessions
    #[arg(long, default_value = "1000")]
    max_sessions: usize,

    /// Tick interval, in milliseconds
    #[arg(long, default_value = "1000")]
    tick_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn runtime_config(&self) -> ServerRuntimeConfig {
        let scenario = ScenarioConfig {
            undo: UndoConfig {
                undo_threshold: Duration::from_millis(self.undo_threshold_ms),
                memory_limit_bytes: self.memory_limit_mb.saturating_mul(1024 * 1024),
            },
            checksum: ChecksumConfig {
                every: self.checksum_every,
                diagnostics: self.diagnostics,
                ..ChecksumConfig::default()
            },
            ..ScenarioConfig::default()
        };

        ServerRuntimeConfig {
            checkpoint_dir: self.checkpoint_dir.clone(),
            production_name: self.scenario_name.clone(),
            tick_interval: Duration::from_millis(self.tick_ms),
            driver: DriverConfig {
                registry: RegistryConfig {
                    scenario,
                    max_loaded_scenarios: self.max_scenarios,
                    ..RegistryConfig::default()
                },
                max_sessions: self.max_sessions,
                ..DriverConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    // stdout carries the protocol
    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    tracing::info!("Plansync server starting");
    tracing::info!("Checkpoints in {}", args.checkpoint_dir.display());

    let server = Server::open(args.runtime_config())?;

    run_stdio(server).await?;

    tracing::info!("Plansync server stopped");
    Ok(())
}
