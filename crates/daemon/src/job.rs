//! Render job records and their public views.

use crate::capability::SystemCapabilities;
use crate::composition::{Composition, OutputOptions};
use crate::encode::EncodingPlan;
use crate::progress::{Phase, ProgressTracker};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Upper bound for failure messages stored on a job.
pub const MAX_ERROR_BYTES: usize = 2048;

/// Lifecycle state of a render job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, pipeline not started yet.
    Initialized,
    /// Frames are being rendered and audio prepared.
    Extracting,
    /// Encoder passes are running.
    Encoding,
    Completed,
    Failed,
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Initialized
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Initialized => write!(f, "initialized"),
            JobStatus::Extracting => write!(f, "extracting"),
            JobStatus::Encoding => write!(f, "encoding"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Phase label reported for this status.
    pub fn phase_label(&self, current: Phase) -> &'static str {
        match self {
            JobStatus::Initialized => "initialized",
            JobStatus::Extracting | JobStatus::Encoding => current.as_str(),
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// A render job as held by the job manager.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub id: String,
    pub status: JobStatus,
    pub composition: Arc<Composition>,
    pub options: OutputOptions,
    pub capabilities: SystemCapabilities,
    pub tracker: ProgressTracker,
    /// Job-exclusive scratch directory.
    pub scratch_dir: PathBuf,
    pub plan: Option<EncodingPlan>,
    /// Final artifact; set only on completion.
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at_ms: i64,
    /// Elapsed seconds frozen when the job reached a terminal state.
    pub finished_elapsed_secs: Option<f64>,
}

impl RenderJob {
    /// Create a job with a fresh UUID and a scratch directory under `scratch_root`.
    pub fn new(
        composition: Arc<Composition>,
        options: OutputOptions,
        capabilities: SystemCapabilities,
        tracker: ProgressTracker,
        scratch_root: &std::path::Path,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let scratch_dir = scratch_root.join(&id);
        Self {
            id,
            status: JobStatus::Initialized,
            composition,
            options,
            capabilities,
            tracker,
            scratch_dir,
            plan: None,
            output_path: None,
            error: None,
            created_at_ms: current_timestamp_ms(),
            finished_elapsed_secs: None,
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.finished_elapsed_secs
            .unwrap_or_else(|| self.tracker.elapsed().as_secs_f64())
    }

    fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.finished_elapsed_secs = Some(self.tracker.elapsed().as_secs_f64());
    }

    pub fn complete(&mut self, output_path: PathBuf) {
        self.tracker.complete_phase(Phase::Encoding);
        self.output_path = Some(output_path);
        self.finish(JobStatus::Completed);
    }

    pub fn fail(&mut self, message: &str) {
        self.error = Some(bound_message(message, MAX_ERROR_BYTES));
        self.finish(JobStatus::Failed);
    }

    pub fn cancel(&mut self) {
        self.finish(JobStatus::Cancelled);
    }

    pub fn phase_label(&self) -> &'static str {
        self.status.phase_label(self.tracker.current_phase())
    }

    pub fn view(&self) -> JobView {
        let snapshot = self.tracker.snapshot();
        let time_remaining_secs = if self.status.is_active() {
            snapshot.time_remaining_secs
        } else {
            None
        };
        JobView {
            id: self.id.clone(),
            status: self.status,
            phase: self.phase_label().to_string(),
            progress: snapshot.overall,
            extraction_progress: self.tracker.phase_progress(Phase::Extraction),
            encoding_progress: self.tracker.phase_progress(Phase::Encoding),
            output_path: if self.status == JobStatus::Completed {
                self.output_path.clone()
            } else {
                None
            },
            error: self.error.clone(),
            created_at_ms: self.created_at_ms,
            elapsed_secs: self.elapsed_secs(),
            time_remaining_secs,
            capabilities: self.capabilities.clone(),
            encoder: self
                .plan
                .as_ref()
                .map(|p| p.codec.encoder_name().to_string()),
            two_pass: self.plan.as_ref().map(|p| p.two_pass),
        }
    }
}

/// Read-only snapshot returned by `status` and `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    pub phase: String,
    pub progress: f64,
    pub extraction_progress: f64,
    pub encoding_progress: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub elapsed_secs: f64,
    pub time_remaining_secs: Option<f64>,
    pub capabilities: SystemCapabilities,
    pub encoder: Option<String>,
    pub two_pass: Option<bool>,
}

/// Cut `message` to at most `max` bytes, keeping its start and its end.
pub fn bound_message(message: &str, max: usize) -> String {
    const MARKER: &str = " ... ";
    if message.len() <= max {
        return message.to_string();
    }
    let budget = max.saturating_sub(MARKER.len());
    let head_len = floor_char_boundary(message, budget / 4);
    let tail_start = ceil_char_boundary(message, message.len() - (budget - budget / 4));
    format!("{}{}{}", &message[..head_len], MARKER, &message[tail_start..])
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Get current timestamp in milliseconds since Unix epoch.
fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::Path;

    fn job() -> RenderJob {
        RenderJob::new(
            Arc::new(Composition::default()),
            OutputOptions {
                width: 1280,
                height: 720,
                fps: 30,
                quality: Default::default(),
                container: Default::default(),
                filename: "clip".into(),
            },
            SystemCapabilities::conservative(),
            ProgressTracker::new(0.6, 0.4),
            Path::new("/scratch"),
        )
    }

    #[test]
    fn test_new_job_is_initialized() {
        let job = job();
        assert_eq!(job.status, JobStatus::Initialized);
        assert_eq!(job.scratch_dir, Path::new("/scratch").join(&job.id));
        assert!(Uuid::parse_str(&job.id).is_ok());
        let view = job.view();
        assert_eq!(view.phase, "initialized");
        assert_eq!(view.progress, 0.0);
        assert!(view.output_path.is_none());
    }

    #[test]
    fn test_output_path_only_exposed_when_completed() {
        let mut job = job();
        job.output_path = Some(PathBuf::from("/scratch/x/clip.mp4"));
        job.status = JobStatus::Encoding;
        assert!(job.view().output_path.is_none());

        job.complete(PathBuf::from("/scratch/x/clip.mp4"));
        let view = job.view();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.progress, 100.0);
        assert_eq!(view.output_path, Some(PathBuf::from("/scratch/x/clip.mp4")));
        assert!(view.time_remaining_secs.is_none());
    }

    #[test]
    fn test_fail_bounds_message() {
        let mut job = job();
        job.fail(&"x".repeat(10_000));
        let error = job.view().error.unwrap();
        assert!(error.len() <= MAX_ERROR_BYTES);
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_status_helpers() {
        assert!(JobStatus::Extracting.is_active());
        assert!(JobStatus::Cancelled.is_terminal());
        assert_eq!(JobStatus::Encoding.to_string(), "encoding");
        assert_eq!(JobStatus::Encoding.phase_label(Phase::Encoding), "encoding");
    }

    #[test]
    fn test_bound_message_keeps_both_ends() {
        let message = format!("encoder pass 2 failed: {}final line", "noise ".repeat(1000));
        let bounded = bound_message(&message, 256);
        assert!(bounded.starts_with("encoder pass 2 failed"));
        assert!(bounded.ends_with("final line"));
        assert!(bounded.len() <= 256);
        assert_eq!(bound_message("short", 256), "short");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_bound_message_respects_limit(message in "\\PC{0,3000}", max in 16usize..4096) {
            let bounded = bound_message(&message, max);
            prop_assert!(bounded.len() <= max);
        }
    }
}
