//! Service startup for the export render daemon
//!
//! Ties configuration, startup checks, the job manager and the HTTP server together.

use crate::config::{Config, ConfigError};
use crate::job_manager::JobManager;
use crate::server::{run_server, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;
use tokio::net::TcpListener;

/// Error type for service operations
#[derive(Debug, Error)]
pub enum ServiceStartError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Scratch directory could not be prepared
    #[error("Scratch directory {path} unusable: {source}")]
    Scratch {
        path: String,
        source: std::io::Error,
    },

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Running state of the daemon
pub struct Service {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Registry of render jobs
    pub manager: JobManager,
}

impl Service {
    /// Initialize the service with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file (defaults when it does not exist)
    /// 2. Apply environment overrides and validate
    /// 3. Run startup checks (encoder version, renderer)
    /// 4. Prepare the scratch directory and job manager
    ///
    /// # Arguments
    /// * `config_path` - Path to the config.toml file
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, ServiceStartError> {
        let config = Config::load_or_default(config_path)?;
        Self::with_config(config).await
    }

    /// Initialize the service with an existing configuration
    pub async fn with_config(config: Config) -> Result<Self, ServiceStartError> {
        run_startup_checks(&config).await?;
        Self::new_without_checks(config).await
    }

    /// Initialize the service without running startup checks
    ///
    /// Useful for testing when the renderer or encoder binaries are not available.
    pub async fn new_without_checks(config: Config) -> Result<Self, ServiceStartError> {
        let manager = JobManager::from_config(&config);
        Self::with_manager(config, manager).await
    }

    /// Initialize the service around an already built manager
    pub async fn with_manager(
        config: Config,
        manager: JobManager,
    ) -> Result<Self, ServiceStartError> {
        let scratch = &manager.settings().scratch_dir;
        tokio::fs::create_dir_all(scratch)
            .await
            .map_err(|source| ServiceStartError::Scratch {
                path: scratch.display().to_string(),
                source,
            })?;
        tracing::info!(scratch_dir = %scratch.display(), "job manager ready");
        Ok(Self { config, manager })
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener, ServiceStartError> {
        let listener = TcpListener::bind(&self.config.service.bind_addr)
            .await
            .map_err(ServerError::from)?;
        Ok(listener)
    }

    /// Serve HTTP on `listener` until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServiceStartError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        run_server(self.manager.clone(), listener, shutdown).await?;
        tracing::info!("http server stopped");
        Ok(())
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> Result<SocketAddr, ServiceStartError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind().await?;
        let addr = listener.local_addr().map_err(ServerError::from)?;
        self.serve(listener, shutdown).await?;
        Ok(addr)
    }
}
