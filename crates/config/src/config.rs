//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Values parsed but are not usable together
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Service-level settings: where jobs live and how long they are kept
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root for per-job scratch directories
    pub scratch_dir: PathBuf,
    /// Address the HTTP surface binds to
    pub bind_addr: String,
    /// Seconds a terminal job stays in the registry before eviction
    pub retention_secs: u64,
    /// Seconds between a successful save and cleanup of the job
    pub save_cleanup_delay_secs: u64,
    /// Capacity of the progress event channel
    pub event_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("/tmp/export-render"),
            bind_addr: "127.0.0.1:7878".to_string(),
            retention_secs: 600,
            save_cleanup_delay_secs: 30,
            event_capacity: 256,
        }
    }
}

/// External binaries the pipeline drives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BinariesConfig {
    /// Frame renderer executable
    pub renderer: String,
    /// Encoder executable (ffmpeg compatible)
    pub encoder: String,
}

impl Default for BinariesConfig {
    fn default() -> Self {
        Self {
            renderer: "frame-renderer".to_string(),
            encoder: "ffmpeg".to_string(),
        }
    }
}

/// Weights of the two job phases in overall progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProgressConfig {
    pub extraction_weight: f64,
    pub encoding_weight: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            extraction_weight: 0.6,
            encoding_weight: 0.4,
        }
    }
}

/// Thresholds below which the host counts as memory constrained
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Total memory threshold in GiB
    pub constrained_total_gib: f64,
    /// Available memory threshold in GiB
    pub constrained_available_gib: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            constrained_total_gib: 8.0,
            constrained_available_gib: 2.0,
        }
    }
}

impl MemoryConfig {
    pub fn total_threshold_bytes(&self) -> u64 {
        gib_to_bytes(self.constrained_total_gib)
    }

    pub fn available_threshold_bytes(&self) -> u64 {
        gib_to_bytes(self.constrained_available_gib)
    }
}

fn gib_to_bytes(gib: f64) -> u64 {
    (gib.max(0.0) * 1024.0 * 1024.0 * 1024.0) as u64
}

/// Subprocess supervision settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessConfig {
    /// Seconds to wait for a killed child to exit after cancellation
    pub kill_timeout_secs: u64,
    /// Bytes of stderr kept for error reports
    pub diagnostic_tail_bytes: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            kill_timeout_secs: 5,
            diagnostic_tail_bytes: 4096,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "export_render_daemon=debug"
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub binaries: BinariesConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Recognised variables:
    /// - RENDER_SCRATCH_DIR -> service.scratch_dir
    /// - RENDER_BIND_ADDR -> service.bind_addr
    /// - RENDER_RETENTION_SECS -> service.retention_secs
    /// - RENDER_RENDERER_BIN -> binaries.renderer
    /// - RENDER_ENCODER_BIN -> binaries.encoder
    /// - RENDER_KILL_TIMEOUT_SECS -> process.kill_timeout_secs
    /// - RENDER_LOG_LEVEL -> logging.level
    /// - RENDER_LOG_JSON -> logging.json
    ///
    /// Values that fail to parse leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RENDER_SCRATCH_DIR") {
            if !val.is_empty() {
                self.service.scratch_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RENDER_BIND_ADDR") {
            if !val.is_empty() {
                self.service.bind_addr = val;
            }
        }

        if let Ok(val) = env::var("RENDER_RETENTION_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.service.retention_secs = secs;
            }
        }

        if let Ok(val) = env::var("RENDER_RENDERER_BIN") {
            if !val.is_empty() {
                self.binaries.renderer = val;
            }
        }

        if let Ok(val) = env::var("RENDER_ENCODER_BIN") {
            if !val.is_empty() {
                self.binaries.encoder = val;
            }
        }

        if let Ok(val) = env::var("RENDER_KILL_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.process.kill_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("RENDER_LOG_LEVEL") {
            if !val.is_empty() {
                self.logging.level = val;
            }
        }

        if let Ok(val) = env::var("RENDER_LOG_JSON") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.logging.json = true,
                "false" | "0" | "no" => self.logging.json = false,
                _ => {}
            }
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = [self.progress.extraction_weight, self.progress.encoding_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Invalid(
                "phase weights must be finite and non-negative".to_string(),
            ));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid(format!(
                "phase weights must sum to 1.0, got {}",
                sum
            )));
        }
        if self.process.kill_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "process.kill_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.process.diagnostic_tail_bytes == 0 {
            return Err(ConfigError::Invalid(
                "process.diagnostic_tail_bytes must be greater than zero".to_string(),
            ));
        }
        if self.service.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "service.event_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from file when it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        for key in [
            "RENDER_SCRATCH_DIR",
            "RENDER_BIND_ADDR",
            "RENDER_RETENTION_SECS",
            "RENDER_RENDERER_BIN",
            "RENDER_ENCODER_BIN",
            "RENDER_KILL_TIMEOUT_SECS",
            "RENDER_LOG_LEVEL",
            "RENDER_LOG_JSON",
        ] {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            retention in 0u64..100_000,
            extraction_weight in 0.0f64..1.0,
            kill_timeout in 1u64..120,
            tail in 1usize..65536,
            json in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[service]
scratch_dir = "/var/tmp/render"
retention_secs = {}

[binaries]
renderer = "my-renderer"
encoder = "/opt/ffmpeg/bin/ffmpeg"

[progress]
extraction_weight = {}
encoding_weight = {}

[process]
kill_timeout_secs = {}
diagnostic_tail_bytes = {}

[logging]
level = "debug"
json = {}
"#,
                retention,
                extraction_weight,
                1.0 - extraction_weight,
                kill_timeout,
                tail,
                json
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(&config.service.scratch_dir, &PathBuf::from("/var/tmp/render"));
            prop_assert_eq!(config.service.retention_secs, retention);
            prop_assert_eq!(&config.binaries.renderer, "my-renderer");
            prop_assert_eq!(&config.binaries.encoder, "/opt/ffmpeg/bin/ffmpeg");
            prop_assert!((config.progress.extraction_weight - extraction_weight).abs() < 1e-9);
            prop_assert_eq!(config.process.kill_timeout_secs, kill_timeout);
            prop_assert_eq!(config.process.diagnostic_tail_bytes, tail);
            prop_assert_eq!(&config.logging.level, "debug");
            prop_assert_eq!(config.logging.json, json);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_overrides_kill_timeout(
            initial in 1u64..60,
            override_secs in 1u64..600,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[process]\nkill_timeout_secs = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RENDER_KILL_TIMEOUT_SECS", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.process.kill_timeout_secs, override_secs);
        }

        #[test]
        fn prop_unbalanced_weights_rejected(
            extraction in 0.0f64..2.0,
            encoding in 0.0f64..2.0,
        ) {
            prop_assume!(((extraction + encoding) - 1.0).abs() > 1e-3);
            let mut config = Config::default();
            config.progress.extraction_weight = extraction;
            config.progress.encoding_weight = encoding;
            prop_assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config, Config::default());
        assert_eq!(config.service.bind_addr, "127.0.0.1:7878");
        assert_eq!(config.binaries.encoder, "ffmpeg");
        assert!((config.progress.extraction_weight - 0.6).abs() < 1e-9);
        assert!((config.progress.encoding_weight - 0.4).abs() < 1e-9);
        assert_eq!(config.process.kill_timeout_secs, 5);
        assert_eq!(config.process.diagnostic_tail_bytes, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_section_keeps_field_defaults() {
        let toml_str = r#"
[service]
bind_addr = "0.0.0.0:9000"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.service.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.service.retention_secs, 600);
        assert_eq!(config.service.scratch_dir, PathBuf::from("/tmp/export-render"));
    }

    #[test]
    fn test_env_overrides_strings_and_bools() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("RENDER_SCRATCH_DIR", "/scratch");
        env::set_var("RENDER_ENCODER_BIN", "/usr/local/bin/ffmpeg");
        env::set_var("RENDER_LOG_JSON", "yes");
        env::set_var("RENDER_RETENTION_SECS", "not-a-number");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.service.scratch_dir, PathBuf::from("/scratch"));
        assert_eq!(config.binaries.encoder, "/usr/local/bin/ffmpeg");
        assert!(config.logging.json);
        assert_eq!(config.service.retention_secs, 600);
    }

    #[test]
    fn test_zero_kill_timeout_rejected() {
        let mut config = Config::default();
        config.process.kill_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_memory_thresholds_in_bytes() {
        let memory = MemoryConfig::default();
        assert_eq!(memory.total_threshold_bytes(), 8 * 1024 * 1024 * 1024);
        assert_eq!(memory.available_threshold_bytes(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();
        let config = Config::load_or_default("/nonexistent/render/config.toml")
            .expect("missing file falls back to defaults");
        assert_eq!(config, Config::default());
    }
}
