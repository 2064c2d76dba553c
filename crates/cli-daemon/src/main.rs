//! CLI entry point for the export render daemon
//!
//! Parses command line arguments, loads configuration and serves the HTTP surface
//! until interrupted.

use clap::Parser;
use export_render_daemon::{init_logging, Config, Service};
use std::path::PathBuf;
use std::process::ExitCode;

/// Export render daemon - renders compositions to video files
#[derive(Parser, Debug)]
#[command(name = "export-render-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); defaults apply when missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Root directory for per-job scratch directories
    #[arg(short, long)]
    scratch_dir: Option<PathBuf>,

    /// Address to serve HTTP on, e.g. 127.0.0.1:7878
    #[arg(short, long)]
    bind: Option<String>,

    /// Skip startup checks (encoder version, renderer). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn load_config(args: &Args) -> Result<Config, String> {
    let mut config = Config::load_or_default(&args.config).map_err(|e| e.to_string())?;
    if let Some(dir) = &args.scratch_dir {
        config.service.scratch_dir = dir.clone();
    }
    if let Some(bind) = &args.bind {
        config.service.bind_addr = bind.clone();
    }
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging);

    tracing::info!(
        config = %args.config.display(),
        scratch_dir = %config.service.scratch_dir.display(),
        bind = %config.service.bind_addr,
        "export render daemon starting"
    );

    let service_result = if args.skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks enabled)");
        Service::new_without_checks(config).await
    } else {
        Service::with_config(config).await
    };

    let service = match service_result {
        Ok(service) => service,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize service");
            return ExitCode::FAILURE;
        }
    };

    match service.run(shutdown_signal()).await {
        Ok(addr) => {
            tracing::info!(%addr, "export render daemon stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "service error");
            ExitCode::FAILURE
        }
    }
}
