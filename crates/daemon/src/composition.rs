//! Composition and output option types accepted by `submit`.
//!
//! The composition is the editor's in-memory description of the timeline. Only the
//! parts the export pipeline reads are modelled here; unknown fields are ignored so
//! the editing surface can evolve independently.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest frame rate accepted for an export.
pub const MAX_FPS: u32 = 240;

/// Largest edge accepted for an export (8K).
pub const MAX_DIMENSION: u32 = 7680;

/// Rejected output options; the job is never created.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("width and height must be non-zero, got {width}x{height}")]
    ZeroDimension { width: u32, height: u32 },

    #[error("{width}x{height} exceeds the maximum edge of 7680")]
    DimensionTooLarge { width: u32, height: u32 },

    #[error("width and height must be even for yuv420p output, got {width}x{height}")]
    OddDimension { width: u32, height: u32 },

    #[error("fps must be between 1 and 240, got {0}")]
    InvalidFps(u32),

    #[error("filename must be a bare file name, got {0:?}")]
    InvalidFilename(String),
}

/// Kind of a composition item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Video,
    Audio,
    Image,
    Text,
    #[serde(other)]
    Other,
}

/// A single clip on the timeline. All times are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionItem {
    pub id: String,
    pub kind: ItemKind,
    /// Source URI of the media, if the item has one.
    #[serde(default)]
    pub src: Option<String>,
    /// Display start on the timeline.
    #[serde(default)]
    pub from_ms: u64,
    /// Display end on the timeline.
    #[serde(default)]
    pub to_ms: Option<u64>,
    /// Total duration of the source media.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub trim_start_ms: Option<u64>,
    #[serde(default)]
    pub trim_end_ms: Option<u64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub playback_rate: Option<f64>,
}

impl CompositionItem {
    /// End of the item on the timeline, when it can be determined.
    pub fn end_ms(&self) -> Option<u64> {
        self.to_ms
            .or_else(|| self.duration_ms.map(|d| self.from_ms.saturating_add(d)))
    }
}

/// The timeline being exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    #[serde(default)]
    pub items: Vec<CompositionItem>,
    /// Explicit timeline duration; overrides anything derived from items.
    #[serde(default)]
    pub timeline_duration_ms: Option<u64>,
    /// Duration used when neither an explicit duration nor item end times exist.
    #[serde(default = "default_duration_ms")]
    pub default_duration_ms: u64,
}

fn default_duration_ms() -> u64 {
    10_000
}

impl Default for Composition {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            timeline_duration_ms: None,
            default_duration_ms: default_duration_ms(),
        }
    }
}

/// Export quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Draft,
    #[default]
    Standard,
    High,
}

/// Output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    #[default]
    Mp4,
    Mov,
    Mkv,
}

impl ContainerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mov => "mov",
            ContainerFormat::Mkv => "mkv",
        }
    }

    /// Whether the container benefits from moving the index to the front.
    pub fn supports_faststart(&self) -> bool {
        matches!(self, ContainerFormat::Mp4 | ContainerFormat::Mov)
    }
}

/// Options describing the file to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputOptions {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default)]
    pub quality: QualityTier,
    #[serde(default)]
    pub container: ContainerFormat,
    pub filename: String,
}

impl OutputOptions {
    /// Reject options that can never produce a valid export.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let (width, height) = (self.width, self.height);
        if width == 0 || height == 0 {
            return Err(ValidationError::ZeroDimension { width, height });
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(ValidationError::DimensionTooLarge { width, height });
        }
        if width % 2 != 0 || height % 2 != 0 {
            return Err(ValidationError::OddDimension { width, height });
        }
        if self.fps == 0 || self.fps > MAX_FPS {
            return Err(ValidationError::InvalidFps(self.fps));
        }
        let name = self.filename.trim();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0')
        {
            return Err(ValidationError::InvalidFilename(self.filename.clone()));
        }
        Ok(())
    }

    /// Output file name with the container extension applied.
    pub fn output_file_name(&self) -> String {
        let ext = self.container.extension();
        let name = self.filename.trim();
        let lower = name.to_lowercase();
        if lower.ends_with(&format!(".{}", ext)) {
            name.to_string()
        } else {
            format!("{}.{}", name, ext)
        }
    }

    /// True for 3840x2160 and above.
    pub fn is_high_resolution(&self) -> bool {
        self.width >= 3840 && self.height >= 2160
    }
}
