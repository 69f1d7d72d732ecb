//! Fleet simulator binary
//!
//! Loads the top-level configuration, starts the supervisor, and runs until
//! interrupted. Exit code 0 on a clean stop, 1 on a startup error.

use clap::Parser;
use fleet_supervisor::Supervisor;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleet-simulator")]
#[command(about = "EV charging-station fleet simulator speaking OCPP-J against a CSMS")]
struct Cli {
    /// Path to the top-level configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Log filter, overriding the configuration file (e.g. "debug",
    /// "fleet_station=trace")
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let supervisor = match Supervisor::new(&cli.config).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            // Logging is not up yet; this must reach the operator regardless
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let level = match cli.log_level {
        Some(level) => level,
        None => {
            let log = supervisor_log_level(&supervisor).await;
            log.unwrap_or_else(|| "info".to_string())
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = supervisor.start().await {
        error!(error = %e, "Simulator startup failed");
        supervisor.shutdown().await;
        return ExitCode::FAILURE;
    }

    info!("Simulator running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Signal handling failed");
    }

    supervisor.shutdown().await;
    ExitCode::SUCCESS
}

async fn supervisor_log_level(supervisor: &Supervisor) -> Option<String> {
    let log = supervisor.log_config().await;
    log.enabled.then_some(log.level)
}
