//! `vq-daemon` — the single long-running process that drives the vision QA
//! engine: job acquisition, task expansion, the analysis/QA worker pool,
//! and result/status reporting back to the job registry.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use vq_core::config::Config;
use vq_daemon::control_socket;
use vq_daemon::daemon::Daemon;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// The vision QA orchestration engine's daemon process.
#[derive(Parser)]
#[command(name = "vq-daemon", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default when no subcommand is given).
    Run,
    /// Request an already-running daemon to reload its configuration
    /// profiles immediately, via the local control socket.
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Reload => reload().await,
    }
}

async fn run() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    vq_telemetry::init_logging("vq-daemon", &config.general.log_level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "vq-daemon starting"
    );

    let daemon = Daemon::new(config).await.context("failed to initialize daemon")?;
    let shutdown = daemon.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating graceful shutdown");
        shutdown.trigger();
    });

    if let Err(e) = daemon.run().await {
        tracing::error!(error = %e, "daemon execution failed");
        std::process::exit(1);
    }

    info!("vq-daemon stopped");
    Ok(())
}

async fn reload() -> Result<()> {
    let socket_path = control_socket::default_socket_path();
    let response = control_socket::request_reload(&socket_path)
        .await
        .with_context(|| format!("failed to reach control socket at {}", socket_path.display()))?;
    println!("{response}");
    if response.starts_with("error") {
        std::process::exit(1);
    }
    Ok(())
}
