//! Encoding plan selection
//!
//! Picks the video codec from the capability snapshot, derives CRF, preset and
//! bitrate from the quality tier and resolution, and lays out one or two encoder
//! passes as ready-to-run argument lists.

use crate::audio::AudioPlan;
use crate::capability::{ArchitectureClass, HardwareAccelerator, SystemCapabilities};
use crate::composition::{OutputOptions, QualityTier};
use crate::extraction::FrameSequence;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Audio bitrate for the final container.
const AUDIO_BITRATE: &str = "192k";

/// Bitrate and CRF scaling for 4K and above.
const HIGH_RES_BITRATE_FACTOR: f64 = 1.25;
const HIGH_RES_CRF_DELTA: u8 = 2;

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("invalid output dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("invalid frame rate {0}")]
    InvalidFps(u32),

    #[error("pass {0} does not read the frame sequence")]
    MissingFramePattern(u8),

    #[error("audio map {expected:?} does not match pass {pass}")]
    AudioMapMismatch { pass: u8, expected: String },

    #[error("expected {expected} passes, plan has {actual}")]
    PassCount { expected: usize, actual: usize },

    #[error("final pass does not write an output file")]
    MissingOutput,
}

/// Video encoder selected for the final pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    VideoToolbox,
    Nvenc,
    QuickSync,
    Libx264,
}

impl Codec {
    pub fn encoder_name(&self) -> &'static str {
        match self {
            Codec::VideoToolbox => HardwareAccelerator::VideoToolbox.h264_encoder(),
            Codec::Nvenc => HardwareAccelerator::Nvenc.h264_encoder(),
            Codec::QuickSync => HardwareAccelerator::QuickSync.h264_encoder(),
            Codec::Libx264 => "libx264",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, Codec::Libx264)
    }
}

/// Codec preference: the accelerator matching the architecture, then GPU, then
/// media engine, then software.
pub fn select_codec(caps: &SystemCapabilities) -> Codec {
    if caps.architecture == ArchitectureClass::EfficientCore
        && caps.has(HardwareAccelerator::VideoToolbox)
    {
        return Codec::VideoToolbox;
    }
    if caps.has(HardwareAccelerator::Nvenc) {
        return Codec::Nvenc;
    }
    if caps.has(HardwareAccelerator::QuickSync) {
        return Codec::QuickSync;
    }
    Codec::Libx264
}

/// Rate control targets shared by every pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualitySettings {
    pub crf: u8,
    /// libx264 preset
    pub preset: &'static str,
    pub bitrate_kbps: u64,
}

pub fn base_crf(tier: QualityTier) -> u8 {
    match tier {
        QualityTier::Draft => 28,
        QualityTier::Standard => 23,
        QualityTier::High => 18,
    }
}

pub fn bits_per_pixel(tier: QualityTier) -> f64 {
    match tier {
        QualityTier::Draft => 0.05,
        QualityTier::Standard => 0.08,
        QualityTier::High => 0.12,
    }
}

/// Derive CRF, preset and bitrate for an export.
///
/// # Arguments
/// * `options` - target resolution, frame rate and quality tier
/// * `memory_constrained` - keeps high resolution exports on the `medium` preset
pub fn quality_settings(options: &OutputOptions, memory_constrained: bool) -> QualitySettings {
    let high_res = options.is_high_resolution();
    let pixels_per_sec = options.width as f64 * options.height as f64 * options.fps as f64;
    let mut bitrate = pixels_per_sec * bits_per_pixel(options.quality);
    let mut crf = base_crf(options.quality);

    let preset = if high_res {
        bitrate *= HIGH_RES_BITRATE_FACTOR;
        crf = crf.saturating_sub(HIGH_RES_CRF_DELTA);
        if memory_constrained {
            "medium"
        } else {
            "slower"
        }
    } else {
        "slow"
    };

    QualitySettings {
        crf,
        preset,
        bitrate_kbps: ((bitrate / 1000.0).round() as u64).max(1),
    }
}

/// One encoder invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncoderPass {
    /// 1-based pass number.
    pub number: u8,
    pub args: Vec<String>,
    /// File the pass writes; `None` for the analysis pass.
    pub output: Option<PathBuf>,
    /// Slice of the encoding phase (0-100) this pass reports into.
    pub progress_start: f64,
    pub progress_end: f64,
    /// Expected media duration, used when the encoder prints no `Duration:` line.
    pub expected_duration_ms: u64,
}

impl EncoderPass {
    pub fn has_arg(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }

    /// Value following `flag`, if present.
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .windows(2)
            .find(|w| w[0] == flag)
            .map(|w| w[1].as_str())
    }

    /// All values following repeated occurrences of `flag`.
    pub fn arg_values<'a>(&'a self, flag: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.args
            .windows(2)
            .filter(move |w| w[0] == flag)
            .map(|w| w[1].as_str())
    }
}

/// The full encoding strategy for a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodingPlan {
    pub codec: Codec,
    pub two_pass: bool,
    pub high_resolution: bool,
    pub quality: QualitySettings,
    pub passes: Vec<EncoderPass>,
    pub batch_size: u32,
}

/// Inputs to [`build_plan`].
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub caps: &'a SystemCapabilities,
    pub options: &'a OutputOptions,
    pub frames: &'a FrameSequence,
    pub audio: &'a AudioPlan,
    pub output_path: &'a Path,
    /// Prefix for libx264 two-pass statistics files.
    pub passlog_prefix: &'a Path,
}

/// Platform null device for analysis-only output.
pub fn null_device() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

/// Build and validate the plan for a job.
pub fn build_plan(req: &PlanRequest<'_>) -> Result<EncodingPlan, PlanError> {
    let options = req.options;
    if options.width == 0 || options.height == 0 {
        return Err(PlanError::InvalidDimensions {
            width: options.width,
            height: options.height,
        });
    }
    if options.fps == 0 {
        return Err(PlanError::InvalidFps(options.fps));
    }

    let codec = select_codec(req.caps);
    let high_resolution = options.is_high_resolution();
    let two_pass = high_resolution || req.caps.is_memory_constrained;
    let quality = quality_settings(options, req.caps.is_memory_constrained);
    let duration_ms = req.frames.duration_ms;

    let passes = if two_pass {
        vec![
            analysis_pass(req, &quality, duration_ms),
            final_pass(req, codec, &quality, 2, (50.0, 100.0)),
        ]
    } else {
        vec![final_pass(req, codec, &quality, 1, (0.0, 100.0))]
    };

    let plan = EncodingPlan {
        codec,
        two_pass,
        high_resolution,
        quality,
        passes,
        batch_size: req.frames.batch_size,
    };
    plan.validate(req.audio, req.frames)?;

    tracing::info!(
        codec = codec.encoder_name(),
        two_pass,
        high_resolution,
        crf = quality.crf,
        preset = quality.preset,
        bitrate_kbps = quality.bitrate_kbps,
        "encoding plan built"
    );
    Ok(plan)
}

fn frame_input_args(frames: &FrameSequence) -> Vec<String> {
    vec![
        "-framerate".to_string(),
        frames.fps.to_string(),
        "-start_number".to_string(),
        "0".to_string(),
        "-i".to_string(),
        frames.pattern_path().to_string_lossy().into_owned(),
    ]
}

fn analysis_pass(req: &PlanRequest<'_>, quality: &QualitySettings, duration_ms: u64) -> EncoderPass {
    let mut args = vec!["-y".to_string(), "-hide_banner".to_string()];
    args.extend(frame_input_args(req.frames));
    args.extend(
        [
            "-map",
            "0:v",
            "-c:v",
            Codec::Libx264.encoder_name(),
            "-preset",
            quality.preset,
            "-b:v",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(format!("{}k", quality.bitrate_kbps));
    args.extend(["-pix_fmt", "yuv420p", "-pass", "1", "-passlogfile"].iter().map(|s| s.to_string()));
    args.push(req.passlog_prefix.to_string_lossy().into_owned());
    args.extend(["-an", "-f", "null", null_device()].iter().map(|s| s.to_string()));

    EncoderPass {
        number: 1,
        args,
        output: None,
        progress_start: 0.0,
        progress_end: 50.0,
        expected_duration_ms: duration_ms,
    }
}

fn final_pass(
    req: &PlanRequest<'_>,
    codec: Codec,
    quality: &QualitySettings,
    number: u8,
    (progress_start, progress_end): (f64, f64),
) -> EncoderPass {
    let mut args = vec!["-y".to_string(), "-hide_banner".to_string()];
    args.extend(frame_input_args(req.frames));
    for input in &req.audio.inputs {
        args.extend(input.args.iter().cloned());
    }
    if let Some(graph) = &req.audio.filter_graph {
        args.push("-filter_complex".to_string());
        args.push(graph.to_string());
    }
    args.extend(["-map".to_string(), "0:v".to_string()]);
    args.extend(["-map".to_string(), req.audio.output_label.clone()]);

    args.push("-c:v".to_string());
    args.push(codec.encoder_name().to_string());
    video_rate_args(&mut args, codec, quality, number > 1);

    if number > 1 && !codec.is_hardware() {
        args.extend(["-pass".to_string(), number.to_string(), "-passlogfile".to_string()]);
        args.push(req.passlog_prefix.to_string_lossy().into_owned());
    }

    args.extend(["-pix_fmt", "yuv420p", "-r"].iter().map(|s| s.to_string()));
    args.push(req.options.fps.to_string());
    args.extend(["-c:a", "aac", "-b:a", AUDIO_BITRATE, "-t"].iter().map(|s| s.to_string()));
    args.push(crate::audio::filter_graph::seconds(req.frames.duration_ms as f64 / 1000.0));
    if req.options.container.supports_faststart() {
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
    }
    args.push(req.output_path.to_string_lossy().into_owned());

    EncoderPass {
        number,
        args,
        output: Some(req.output_path.to_path_buf()),
        progress_start,
        progress_end,
        expected_duration_ms: req.frames.duration_ms,
    }
}

/// Rate control for the final pass. Software two-pass targets a bitrate so the
/// first pass statistics apply; everything else is quality based.
fn video_rate_args(args: &mut Vec<String>, codec: Codec, quality: &QualitySettings, second_pass: bool) {
    let bitrate = format!("{}k", quality.bitrate_kbps);
    let maxrate = format!("{}k", quality.bitrate_kbps * 3 / 2);
    let bufsize = format!("{}k", quality.bitrate_kbps * 2);
    let crf = quality.crf.to_string();

    let (bitrate, maxrate, bufsize, crf) =
        (bitrate.as_str(), maxrate.as_str(), bufsize.as_str(), crf.as_str());

    let rate: Vec<&str> = match codec {
        Codec::Libx264 if second_pass => vec!["-preset", quality.preset, "-b:v", bitrate],
        Codec::Libx264 => vec!["-preset", quality.preset, "-crf", crf],
        Codec::Nvenc => vec![
            "-preset", "p5", "-rc", "vbr", "-cq", crf, "-b:v", bitrate, "-maxrate", maxrate,
        ],
        Codec::QuickSync => vec!["-preset", "slow", "-global_quality", crf, "-look_ahead", "1"],
        Codec::VideoToolbox => vec![
            "-b:v", bitrate, "-maxrate", maxrate, "-bufsize", bufsize, "-allow_sw", "1",
        ],
    };
    args.extend(rate.into_iter().map(String::from));
}

impl EncodingPlan {
    /// Structural checks run before any process is spawned.
    pub fn validate(&self, audio: &AudioPlan, frames: &FrameSequence) -> Result<(), PlanError> {
        let expected = if self.two_pass { 2 } else { 1 };
        if self.passes.len() != expected {
            return Err(PlanError::PassCount {
                expected,
                actual: self.passes.len(),
            });
        }

        let pattern = frames.pattern_path().to_string_lossy().into_owned();
        for pass in &self.passes {
            if pass.arg_value("-i") != Some(pattern.as_str()) {
                return Err(PlanError::MissingFramePattern(pass.number));
            }
        }

        let last = self.passes.last().ok_or(PlanError::PassCount {
            expected,
            actual: 0,
        })?;
        if last.output.is_none() {
            return Err(PlanError::MissingOutput);
        }

        let mapped = last.arg_values("-map").any(|m| m == audio.output_label);
        let graph_matches = match &audio.filter_graph {
            Some(graph) => {
                let label = graph.output_label().map(|l| format!("[{}]", l));
                label.as_deref() == Some(audio.output_label.as_str())
                    && last.has_arg("-filter_complex")
            }
            None => !last.has_arg("-filter_complex"),
        };
        if !mapped || !graph_matches {
            return Err(PlanError::AudioMapMismatch {
                pass: last.number,
                expected: audio.output_label.clone(),
            });
        }

        Ok(())
    }

    pub fn final_pass(&self) -> Option<&EncoderPass> {
        self.passes.last()
    }
}
