//! Frame extraction orchestration
//!
//! Works out how many frames a composition needs, picks a memory-safe batch size,
//! drives the external frame renderer over the full range and verifies the numbered
//! frame sequence the encoder will read.

use crate::capability::SystemCapabilities;
use crate::composition::{Composition, OutputOptions};
use crate::subprocess::{describe_exit, wait_or_cancel, TailBuffer, WaitOutcome};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

/// Minimum zero-padding of frame numbers.
const MIN_PAD_WIDTH: usize = 6;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("composition resolves to zero frames ({duration_ms} ms at {fps} fps)")]
    InvalidFrameCount { duration_ms: u64, fps: u32 },

    #[error("invalid render dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("failed to start frame renderer: {0}")]
    Spawn(std::io::Error),

    #[error("frame renderer failed ({status}): {stderr}")]
    RendererFailed { status: String, stderr: String },

    #[error("renderer produced {found} of {expected} frames, first missing: {first_missing}")]
    MissingFrames {
        expected: u64,
        found: u64,
        first_missing: String,
    },

    #[error("frame extraction cancelled")]
    Cancelled,

    #[error("IO error during extraction: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolution buckets used by the batch size table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionClass {
    UltraHd,
    FullHd,
    Other,
}

pub fn resolution_class(width: u32, height: u32) -> ResolutionClass {
    if width >= 3840 && height >= 2160 {
        ResolutionClass::UltraHd
    } else if width >= 1920 && height >= 1080 {
        ResolutionClass::FullHd
    } else {
        ResolutionClass::Other
    }
}

/// Frames the renderer may hold in memory at once.
pub fn batch_size(memory_constrained: bool, class: ResolutionClass) -> u32 {
    match (memory_constrained, class) {
        (true, ResolutionClass::UltraHd) => 10,
        (true, ResolutionClass::FullHd) => 15,
        (true, ResolutionClass::Other) => 20,
        (false, ResolutionClass::UltraHd) => 20,
        (false, ResolutionClass::FullHd) => 30,
        (false, ResolutionClass::Other) => 60,
    }
}

/// Authoritative timeline length in milliseconds.
///
/// An explicit timeline duration wins, then the latest item end, then the
/// composition default.
pub fn resolve_duration_ms(composition: &Composition) -> u64 {
    if let Some(explicit) = composition.timeline_duration_ms {
        return explicit;
    }
    composition
        .items
        .iter()
        .filter_map(|item| item.end_ms())
        .max()
        .unwrap_or(composition.default_duration_ms)
}

/// ceil(duration_ms / 1000 * fps) without floating point error.
pub fn total_frames(duration_ms: u64, fps: u32) -> u64 {
    let scaled = duration_ms as u128 * fps as u128;
    scaled.div_ceil(1000) as u64
}

/// A numbered image sequence on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSequence {
    pub dir: PathBuf,
    pub total_frames: u64,
    pub pad_width: usize,
    pub fps: u32,
    pub duration_ms: u64,
    pub batch_size: u32,
}

impl FrameSequence {
    pub fn new(dir: PathBuf, total_frames: u64, fps: u32, duration_ms: u64, batch_size: u32) -> Self {
        let digits = total_frames.max(1).to_string().len();
        Self {
            dir,
            total_frames,
            pad_width: digits.max(MIN_PAD_WIDTH),
            fps,
            duration_ms,
            batch_size,
        }
    }

    /// printf-style pattern, e.g. `frame-%06d.png`
    pub fn pattern(&self) -> String {
        format!("frame-%0{}d.png", self.pad_width)
    }

    pub fn pattern_path(&self) -> PathBuf {
        self.dir.join(self.pattern())
    }

    pub fn file_name(&self, index: u64) -> String {
        format!("frame-{:0width$}.png", index, width = self.pad_width)
    }

    pub fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.join(self.file_name(index))
    }

    /// Check every frame from 0 to total-1 exists.
    pub fn verify(&self) -> Result<(), ExtractionError> {
        let mut found = 0u64;
        let mut first_missing = None;
        for index in 0..self.total_frames {
            if self.frame_path(index).is_file() {
                found += 1;
            } else if first_missing.is_none() {
                first_missing = Some(self.file_name(index));
            }
        }
        match first_missing {
            None => Ok(()),
            Some(first_missing) => Err(ExtractionError::MissingFrames {
                expected: self.total_frames,
                found,
                first_missing,
            }),
        }
    }

    /// [`verify`](Self::verify) on the blocking thread pool.
    pub async fn verify_blocking(&self) -> Result<(), ExtractionError> {
        let sequence = self.clone();
        tokio::task::spawn_blocking(move || sequence.verify())
            .await
            .map_err(|e| ExtractionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

/// Everything the renderer needs for one invocation.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub composition: Arc<Composition>,
    /// First frame index, inclusive.
    pub start_frame: u64,
    /// Last frame index, inclusive.
    pub end_frame: u64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub batch_size: u32,
    pub output_dir: PathBuf,
    pub pattern: String,
}

/// The external frame renderer.
///
/// Implementations write one image per frame into `request.output_dir` named by
/// `request.pattern` and call `on_rendered` with the running count of frames written.
#[async_trait::async_trait]
pub trait FrameRenderer: Send + Sync {
    async fn render(
        &self,
        request: &RenderRequest,
        on_rendered: &(dyn Fn(u64) + Send + Sync),
        cancel: watch::Receiver<bool>,
    ) -> Result<(), ExtractionError>;
}

/// Renderer that shells out to a binary.
///
/// The composition JSON is written to stdin; the binary reports `rendered=<count>`
/// lines on stdout and diagnostics on stderr.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    kill_timeout: Duration,
    tail_bytes: usize,
}

impl CommandRenderer {
    pub fn new(program: impl Into<String>, kill_timeout: Duration, tail_bytes: usize) -> Self {
        Self {
            program: program.into(),
            kill_timeout,
            tail_bytes,
        }
    }

    pub fn build_command(&self, request: &RenderRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--frames")
            .arg(format!("{}-{}", request.start_frame, request.end_frame))
            .arg("--width")
            .arg(request.width.to_string())
            .arg("--height")
            .arg(request.height.to_string())
            .arg("--fps")
            .arg(request.fps.to_string())
            .arg("--batch-size")
            .arg(request.batch_size.to_string())
            .arg("--output-dir")
            .arg(&request.output_dir)
            .arg("--pattern")
            .arg(&request.pattern);
        cmd
    }
}

/// Parse a `rendered=<count>` progress line.
pub fn parse_rendered_line(line: &str) -> Option<u64> {
    line.trim().strip_prefix("rendered=")?.trim().parse().ok()
}

#[async_trait::async_trait]
impl FrameRenderer for CommandRenderer {
    async fn render(
        &self,
        request: &RenderRequest,
        on_rendered: &(dyn Fn(u64) + Send + Sync),
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), ExtractionError> {
        let payload = serde_json::to_vec(request.composition.as_ref())
            .map_err(|e| ExtractionError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        let mut child = self
            .build_command(request)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExtractionError::Spawn)?;

        tracing::debug!(program = %self.program, pid = ?child.id(), "frame renderer started");

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(error = %e, "renderer closed stdin early");
                }
            });
        }

        let stderr_task = child.stderr.take().map(|stderr| {
            let capacity = self.tail_bytes;
            tokio::spawn(async move {
                let mut tail = TailBuffer::new(capacity);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tail.push_line(&line);
                }
                tail
            })
        });

        let stdout = child.stdout.take();
        let progress = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(count) = parse_rendered_line(&line) {
                        on_rendered(count);
                    }
                }
            }
        };

        let (outcome, ()) = tokio::join!(
            wait_or_cancel(&mut child, &mut cancel, self.kill_timeout),
            progress
        );

        let stderr = match stderr_task {
            Some(task) => task.await.map(|t| t.contents()).unwrap_or_default(),
            None => String::new(),
        };

        match outcome? {
            WaitOutcome::Cancelled => Err(ExtractionError::Cancelled),
            WaitOutcome::Exited(status) if status.success() => Ok(()),
            WaitOutcome::Exited(status) => Err(ExtractionError::RendererFailed {
                status: describe_exit(&status),
                stderr,
            }),
        }
    }
}

/// Drives one job's extraction phase.
#[derive(Clone)]
pub struct ExtractionOrchestrator {
    renderer: Arc<dyn FrameRenderer>,
}

impl ExtractionOrchestrator {
    pub fn new(renderer: Arc<dyn FrameRenderer>) -> Self {
        Self { renderer }
    }

    /// Plan the frame sequence without rendering anything.
    pub fn plan(
        composition: &Composition,
        options: &OutputOptions,
        caps: &SystemCapabilities,
        frames_dir: &Path,
    ) -> Result<FrameSequence, ExtractionError> {
        if options.width == 0 || options.height == 0 {
            return Err(ExtractionError::InvalidDimensions {
                width: options.width,
                height: options.height,
            });
        }
        let duration_ms = resolve_duration_ms(composition);
        let frames = total_frames(duration_ms, options.fps);
        if frames == 0 {
            return Err(ExtractionError::InvalidFrameCount {
                duration_ms,
                fps: options.fps,
            });
        }
        let batch = batch_size(
            caps.is_memory_constrained,
            resolution_class(options.width, options.height),
        );
        Ok(FrameSequence::new(
            frames_dir.to_path_buf(),
            frames,
            options.fps,
            duration_ms,
            batch,
        ))
    }

    /// Render every frame of the composition into `frames_dir`.
    ///
    /// `on_progress` receives extraction progress in percent (0-100).
    pub async fn extract(
        &self,
        composition: Arc<Composition>,
        options: &OutputOptions,
        caps: &SystemCapabilities,
        frames_dir: &Path,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        cancel: watch::Receiver<bool>,
    ) -> Result<FrameSequence, ExtractionError> {
        let sequence = Self::plan(&composition, options, caps, frames_dir)?;
        tokio::fs::create_dir_all(&sequence.dir).await?;

        tracing::info!(
            total_frames = sequence.total_frames,
            batch_size = sequence.batch_size,
            duration_ms = sequence.duration_ms,
            "starting frame extraction"
        );

        let request = RenderRequest {
            composition,
            start_frame: 0,
            end_frame: sequence.total_frames - 1,
            width: options.width,
            height: options.height,
            fps: options.fps,
            batch_size: sequence.batch_size,
            output_dir: sequence.dir.clone(),
            pattern: sequence.pattern(),
        };

        let total = sequence.total_frames;
        let report = move |rendered: u64| {
            let percent = rendered.min(total) as f64 / total as f64 * 100.0;
            on_progress(percent);
        };

        self.renderer.render(&request, &report, cancel).await?;
        sequence.verify_blocking().await?;
        on_progress(100.0);

        Ok(sequence)
    }
}
