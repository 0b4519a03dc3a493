//! Daemon lifecycle: configuration loading, startup checks, background
//! workers and the HTTP server.

use crate::server::{run_server, AppState, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use wavebox_config::{Config, ConfigError};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// The wavebox daemon: owns the shared state and drives serving.
pub struct Daemon {
    state: Arc<AppState>,
}

impl Daemon {
    /// Loads configuration for the daemon.
    ///
    /// A missing config file falls back to defaults plus environment
    /// overrides, so the daemon can run without any file at all.
    pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<Config, ConfigError> {
        if config_path.as_ref().is_file() {
            Config::load(config_path)
        } else {
            info!(
                path = %config_path.as_ref().display(),
                "no config file, using defaults with environment overrides"
            );
            let mut config = Config::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Builds a daemon from a config file, running startup checks.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        Self::with_config(Self::load_config(config_path)?)
    }

    /// Builds a daemon from an already-loaded configuration.
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Ok(Self {
            state: Arc::new(AppState::new(config)),
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Starts the background cache builder plus watcher and serves HTTP
    /// until the server exits.
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.state.library.start_background();
        let bind_addr = self.state.config.server.bind_addr.clone();
        info!(
            media_root = %self.state.config.library.media_root,
            bind_addr,
            "wavebox daemon starting"
        );
        run_server(self.state.clone(), &bind_addr).await?;
        Ok(())
    }
}
