//! loopd - the loop swap daemon
//!
//! Loads the layered configuration, sets up logging and runs the daemon
//! until it is interrupted or one of its tasks fails.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use loopd_config::{ConfigLoader, DaemonConfig, ENV_PREFIX};
use loopd_daemon::Daemon;
use loopd_metrics::{init_tracing, MetricsCollector};
use loopd_swap::SimulatedConnector;
use loopd_types::{Network, DAEMON_VERSION};
use tracing::{error, info, warn};

/// Loop swap daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML, YAML or JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Network to operate on
    #[arg(long)]
    network: Option<Network>,

    /// Directory for network data, credentials and the root key database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Address for the RPC endpoint
    #[arg(long)]
    rpc_listen: Option<String>,

    /// Address for the REST gateway; empty disables it
    #[arg(long)]
    rest_listen: Option<String>,

    /// Log level or filter directive
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,

    /// Advance simulated swaps every N milliseconds
    #[arg(long)]
    sim_tick_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_tracing(&config.logging.level, config.logging.json, MetricsCollector::new())
        .context("failed to initialise logging")?;
    info!(version = DAEMON_VERSION, "loopd starting");

    let connector = SimulatedConnector {
        tick: args.sim_tick_ms.map(Duration::from_millis),
    };
    let daemon = Arc::new(Daemon::from_config(config).with_connector(Arc::new(connector)));

    daemon.start().await.context("failed to start loop daemon")?;

    let signals = daemon.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signals.stop();
    });

    if let Err(err) = daemon.wait().await {
        error!(error = %err, "Loop daemon exited with an error");
        return Err(err).context("loop daemon stopped");
    }

    info!("Shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => ConfigLoader::from_file_with_env(path, ENV_PREFIX)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ConfigLoader::from_env_with_prefix(ENV_PREFIX)
            .context("failed to load configuration from the environment")?,
    };

    // Command line flags win over file and environment
    if let Some(network) = args.network {
        config.network = network;
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(addr) = &args.rpc_listen {
        config.rpc_listen = addr.clone();
    }
    if let Some(addr) = &args.rest_listen {
        config.rest_listen = addr.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json = true;
    }

    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Unable to listen for interrupts");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received interrupt"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
