//! Host capability detection
//!
//! Produces a per-job snapshot of architecture, memory and hardware encoders.
//! Detection is best-effort: any failing query degrades to conservative defaults
//! (constrained memory, no accelerators) and never blocks job creation.

use crate::config::MemoryConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Errors raised while querying the host. Never surfaced to callers.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("failed to query encoder list: {0}")]
    EncoderQuery(#[from] std::io::Error),

    #[error("encoder list query exited unsuccessfully")]
    EncoderExit,

    #[error("memory information unavailable")]
    MemoryUnavailable,
}

/// Coarse CPU architecture class used to pick a matching accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchitectureClass {
    /// Apple silicon style SoC with an integrated media engine.
    EfficientCore,
    General,
}

/// Hardware video encoders the planner knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareAccelerator {
    VideoToolbox,
    Nvenc,
    QuickSync,
}

impl HardwareAccelerator {
    /// Substring identifying the accelerator in encoder names
    pub fn marker(&self) -> &'static str {
        match self {
            HardwareAccelerator::VideoToolbox => "videotoolbox",
            HardwareAccelerator::Nvenc => "nvenc",
            HardwareAccelerator::QuickSync => "qsv",
        }
    }

    /// H.264 encoder name for this accelerator
    pub fn h264_encoder(&self) -> &'static str {
        match self {
            HardwareAccelerator::VideoToolbox => "h264_videotoolbox",
            HardwareAccelerator::Nvenc => "h264_nvenc",
            HardwareAccelerator::QuickSync => "h264_qsv",
        }
    }

    const ALL: [HardwareAccelerator; 3] = [
        HardwareAccelerator::VideoToolbox,
        HardwareAccelerator::Nvenc,
        HardwareAccelerator::QuickSync,
    ];
}

/// Immutable snapshot of host capabilities taken when a job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemCapabilities {
    pub architecture: ArchitectureClass,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub accelerators: BTreeSet<HardwareAccelerator>,
    pub is_memory_constrained: bool,
}

impl SystemCapabilities {
    /// Defaults used when detection fails.
    pub fn conservative() -> Self {
        Self {
            architecture: ArchitectureClass::General,
            total_memory_bytes: 0,
            available_memory_bytes: 0,
            accelerators: BTreeSet::new(),
            is_memory_constrained: true,
        }
    }

    pub fn has(&self, accelerator: HardwareAccelerator) -> bool {
        self.accelerators.contains(&accelerator)
    }
}

/// Source of capability snapshots. Injected into the job manager so tests can pin
/// the host description.
#[async_trait::async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn detect(&self) -> SystemCapabilities;
}

/// Probe backed by sysinfo and the encoder binary.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    encoder_bin: String,
    memory: MemoryConfig,
}

impl SystemProbe {
    pub fn new(encoder_bin: impl Into<String>, memory: MemoryConfig) -> Self {
        Self {
            encoder_bin: encoder_bin.into(),
            memory,
        }
    }

    fn detect_blocking(&self) -> SystemCapabilities {
        let architecture = classify_architecture(std::env::consts::OS, std::env::consts::ARCH);

        let (total, available, constrained) = match read_memory() {
            Ok((total, available)) => (
                total,
                available,
                is_memory_constrained(total, available, &self.memory),
            ),
            Err(e) => {
                tracing::warn!(error = %e, "memory query failed, assuming constrained memory");
                (0, 0, true)
            }
        };

        let accelerators = match list_encoders(&self.encoder_bin) {
            Ok(listing) => {
                let names = parse_encoder_names(&listing);
                accelerators_from_encoders(&names)
                    .into_iter()
                    .filter(|acc| platform_supports(*acc))
                    .collect()
            }
            Err(e) => {
                tracing::warn!(error = %e, encoder = %self.encoder_bin, "encoder query failed, assuming no hardware accelerators");
                BTreeSet::new()
            }
        };

        SystemCapabilities {
            architecture,
            total_memory_bytes: total,
            available_memory_bytes: available,
            accelerators,
            is_memory_constrained: constrained,
        }
    }
}

#[async_trait::async_trait]
impl CapabilityProbe for SystemProbe {
    async fn detect(&self) -> SystemCapabilities {
        let probe = self.clone();
        let caps = tokio::task::spawn_blocking(move || probe.detect_blocking())
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "capability detection task failed");
                SystemCapabilities::conservative()
            });
        tracing::debug!(?caps, "capabilities detected");
        caps
    }
}

/// Probe that always returns the same snapshot.
#[derive(Debug, Clone)]
pub struct FixedProbe(pub SystemCapabilities);

#[async_trait::async_trait]
impl CapabilityProbe for FixedProbe {
    async fn detect(&self) -> SystemCapabilities {
        self.0.clone()
    }
}

/// Classify the host from `std::env::consts` style OS and architecture names.
pub fn classify_architecture(os: &str, arch: &str) -> ArchitectureClass {
    if os == "macos" && arch == "aarch64" {
        ArchitectureClass::EfficientCore
    } else {
        ArchitectureClass::General
    }
}

/// Constrained when either total or currently available memory is under threshold.
pub fn is_memory_constrained(total: u64, available: u64, cfg: &MemoryConfig) -> bool {
    total == 0
        || total < cfg.total_threshold_bytes()
        || available < cfg.available_threshold_bytes()
}

fn read_memory() -> Result<(u64, u64), CapabilityError> {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_memory();

    let total = sys.total_memory();
    if total == 0 {
        return Err(CapabilityError::MemoryUnavailable);
    }
    Ok((total, sys.available_memory()))
}

fn list_encoders(encoder_bin: &str) -> Result<String, CapabilityError> {
    let output = Command::new(encoder_bin)
        .args(["-hide_banner", "-encoders"])
        .output()?;

    if !output.status.success() {
        return Err(CapabilityError::EncoderExit);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extract encoder names from `-encoders` output.
///
/// The listing is a legend, a dashed separator, then one encoder per line with a
/// capability flag column followed by the name.
pub fn parse_encoder_names(listing: &str) -> BTreeSet<String> {
    let mut past_separator = false;
    let mut names = BTreeSet::new();

    for line in listing.lines() {
        let trimmed = line.trim();
        if !past_separator {
            if trimmed.starts_with("---") {
                past_separator = true;
            }
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        if let (Some(_flags), Some(name)) = (parts.next(), parts.next()) {
            names.insert(name.to_string());
        }
    }

    names
}

/// Map encoder names onto the accelerators they belong to.
pub fn accelerators_from_encoders(names: &BTreeSet<String>) -> BTreeSet<HardwareAccelerator> {
    HardwareAccelerator::ALL
        .iter()
        .copied()
        .filter(|acc| names.iter().any(|n| n.starts_with("h264_") && n.contains(acc.marker())))
        .collect()
}

fn platform_supports(accelerator: HardwareAccelerator) -> bool {
    match accelerator {
        HardwareAccelerator::VideoToolbox => cfg!(target_os = "macos"),
        HardwareAccelerator::Nvenc => nvidia_gpu_present(),
        HardwareAccelerator::QuickSync => {
            cfg!(target_os = "windows")
                || (cfg!(target_os = "linux") && Path::new("/dev/dri/renderD128").exists())
        }
    }
}

fn nvidia_gpu_present() -> bool {
    Command::new("nvidia-smi")
        .arg("-L")
        .output()
        .map(|o| o.status.success() && !o.stdout.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCODERS_FIXTURE: &str = "Encoders:
 V..... = Video
 A..... = Audio
 S..... = Subtitle
 .F.... = Frame-level multithreading
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC / MPEG-4 part 10 (codec h264)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 V..... h264_qsv             H.264 / AVC / MPEG-4 AVC / MPEG-4 part 10 (Intel Quick Sync Video acceleration) (codec h264)
 V....D hevc_videotoolbox    VideoToolbox H.265 Encoder (codec hevc)
 A....D aac                  AAC (Advanced Audio Coding)
";

    #[test]
    fn test_parse_encoder_names_skips_legend() {
        let names = parse_encoder_names(ENCODERS_FIXTURE);
        assert!(names.contains("libx264"));
        assert!(names.contains("h264_nvenc"));
        assert!(names.contains("aac"));
        assert!(!names.contains("="));
        assert!(!names.contains("Video"));
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_accelerators_require_h264_encoder() {
        let names = parse_encoder_names(ENCODERS_FIXTURE);
        let accs = accelerators_from_encoders(&names);

        assert!(accs.contains(&HardwareAccelerator::Nvenc));
        assert!(accs.contains(&HardwareAccelerator::QuickSync));
        // Only the HEVC VideoToolbox encoder is present
        assert!(!accs.contains(&HardwareAccelerator::VideoToolbox));
    }

    #[test]
    fn test_no_encoders_means_no_accelerators() {
        assert!(accelerators_from_encoders(&parse_encoder_names("")).is_empty());
    }

    #[test]
    fn test_classify_architecture() {
        assert_eq!(
            classify_architecture("macos", "aarch64"),
            ArchitectureClass::EfficientCore
        );
        assert_eq!(classify_architecture("macos", "x86_64"), ArchitectureClass::General);
        assert_eq!(classify_architecture("linux", "aarch64"), ArchitectureClass::General);
    }

    #[test]
    fn test_memory_constraint_thresholds() {
        let cfg = MemoryConfig::default();
        let gib = 1024 * 1024 * 1024;

        assert!(!is_memory_constrained(16 * gib, 8 * gib, &cfg));
        assert!(is_memory_constrained(4 * gib, 3 * gib, &cfg));
        assert!(is_memory_constrained(32 * gib, gib, &cfg));
        assert!(is_memory_constrained(0, 0, &cfg));
    }

    #[test]
    fn test_conservative_defaults() {
        let caps = SystemCapabilities::conservative();
        assert!(caps.is_memory_constrained);
        assert!(caps.accelerators.is_empty());
        assert_eq!(caps.architecture, ArchitectureClass::General);
    }

    #[tokio::test]
    async fn test_missing_encoder_binary_degrades_gracefully() {
        let probe = SystemProbe::new("/nonexistent/encoder-binary", MemoryConfig::default());
        let caps = probe.detect().await;
        assert!(caps.accelerators.is_empty());
    }
}
