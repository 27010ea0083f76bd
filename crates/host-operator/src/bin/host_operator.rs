//! Host operator entrypoint.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use host_operator::config::DEFAULT_CONFIG_PATH;
use host_operator::{run_host_controller, OperatorConfig};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Drive Hetzner dedicated servers through rescue boot, install and release.
#[derive(Parser)]
#[command(name = "host-operator", version)]
struct Cli {
    /// Namespace whose hosts are reconciled.
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Operator configuration file.
    #[arg(long, env = "OPERATOR_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("host_operator=debug,hetzner_provider=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
            _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = OperatorConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate().context("Invalid operator configuration")?;
    info!(
        namespace = %cli.namespace,
        config = %cli.config.display(),
        robot = %config.endpoints.robot,
        "Starting host operator"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    run_host_controller(client, cli.namespace, config, shutdown).await;
    info!("Host operator stopped");
    Ok(())
}
