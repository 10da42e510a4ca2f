//! edgeprobe - network outage detection
//!
//! Pings targets and probes DNS continuously, opens an outage episode when a
//! target degrades, traces the path to it, and writes every episode as
//! structured JSON lines.

mod config;
mod detector;
mod probe;
mod scheduler;
mod sink;

use clap::Parser;
use config::{Config, DEFAULT_CONFIG_PATH};
use scheduler::{Monitor, MonitorError};
use sink::{RecordWriter, RotatingFile};

use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "edgeprobe", version, about = "Network outage detector")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "EDGEPROBE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("edgeprobe=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("edgeprobe: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), MonitorError> {
    let cfg = Config::load(&args.config)?;
    tracing::info!("Loaded configuration from {}", args.config.display());

    let file = RotatingFile::open(&cfg.logging.dir, cfg.logging.max_bytes(), cfg.logging.max_files())?;
    tracing::info!("Writing records to {}", file.path().display());
    let writer = RecordWriter::new(file, sink::host_id());

    Monitor::new(cfg, writer).run(shutdown_signal()).await
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
