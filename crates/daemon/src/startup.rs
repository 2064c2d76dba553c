//! Startup checks for the export render daemon
//!
//! Verifies that the external binaries the pipeline drives are usable before the
//! HTTP surface starts accepting jobs:
//! - Encoder answers `-version` with a supported major version
//! - Renderer answers `--version`

use crate::config::Config;
use thiserror::Error;
use tokio::process::Command;

/// Oldest encoder major version whose filters and flags the planner relies on
pub const MIN_ENCODER_MAJOR: u32 = 5;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Renderer not available: {0}")]
    RendererUnavailable(String),

    #[error("Encoder version requirement not met: {0}")]
    EncoderVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n6.0-... ..."
/// - Distribution builds: "ffmpeg version 4.4.2-0ubuntu0.22.04.1 ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    // Major version ends at the first '.' or '-'
    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Accept `major` when it meets [`MIN_ENCODER_MAJOR`]
pub fn check_encoder_major(major: u32) -> Result<(), StartupError> {
    if major < MIN_ENCODER_MAJOR {
        return Err(StartupError::EncoderVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_ENCODER_MAJOR, major
        )));
    }
    Ok(())
}

/// Run `<encoder> -version` and check the reported major version
///
/// # Arguments
/// * `program` - Encoder executable name or path
///
/// # Returns
/// * `Ok(major)` - Parsed major version
/// * `Err(StartupError)` - Binary missing, failing, unparseable or too old
pub async fn check_encoder_version(program: &str) -> Result<u32, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .await
        .map_err(|e| {
            StartupError::EncoderVersion(format!("Failed to run {} -version: {}", program, e))
        })?;

    if !output.status.success() {
        return Err(StartupError::EncoderVersion(format!(
            "{} -version failed",
            program
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major_version = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::EncoderVersion(format!(
            "Could not parse encoder version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    check_encoder_major(major_version)?;
    Ok(major_version)
}

/// Check the renderer is available by running `<renderer> --version`
pub async fn check_renderer_available(program: &str) -> Result<(), StartupError> {
    let output = Command::new(program)
        .arg("--version")
        .output()
        .await
        .map_err(|e| {
            StartupError::RendererUnavailable(format!(
                "{} --version failed; is the renderer installed and in PATH? Error: {}",
                program, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::RendererUnavailable(format!(
            "{} --version exited with {}",
            program, output.status
        )));
    }

    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. Encoder version
/// 2. Renderer availability
pub async fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let major = check_encoder_version(&cfg.binaries.encoder).await?;
    tracing::info!(encoder = %cfg.binaries.encoder, major, "encoder check passed");
    check_renderer_available(&cfg.binaries.renderer).await?;
    tracing::info!(renderer = %cfg.binaries.renderer, "renderer check passed");
    Ok(())
}
