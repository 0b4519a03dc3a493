//! CLI entry point for the wavebox daemon.
//!
//! Parses command line arguments, initializes logging, and starts the
//! daemon.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;
use wavebox_daemon::Daemon;

/// Wavebox - media library daemon with streaming and recording intake
#[derive(Parser, Debug)]
#[command(name = "wavebox")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the media root directory
    #[arg(long)]
    media_root: Option<String>,

    /// Override the HTTP bind address, e.g. 0.0.0.0:7878
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = match Daemon::load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    // CLI flags beat both file and environment
    if let Some(media_root) = args.media_root {
        config.library.media_root = media_root;
    }
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    let daemon = match Daemon::with_config(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
