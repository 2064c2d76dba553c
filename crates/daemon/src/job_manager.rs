//! Job lifecycle management
//!
//! The [`JobManager`] owns the registry of render jobs. Each submitted job runs as
//! its own task: frames and audio are prepared concurrently, then the encoding plan
//! is executed pass by pass. Progress is applied to the registry under its write
//! lock only while the job is still active, so nothing is reported for a job after
//! it has been cancelled or finished.

use crate::audio::{AssetDownloadError, AssetFetcher, AudioProcessor, HttpAssetFetcher};
use crate::capability::{CapabilityProbe, SystemCapabilities, SystemProbe};
use crate::composition::{Composition, OutputOptions, ValidationError};
use crate::config::Config;
use crate::encode::{
    build_plan, EncodeError, EncoderExecutor, PlanError, PlanRequest, ProcessRunner,
};
use crate::extraction::{
    resolve_duration_ms, CommandRenderer, ExtractionError, ExtractionOrchestrator, FrameRenderer,
};
use crate::job::{JobStatus, JobView, RenderJob};
use crate::progress::{
    event_channel, memory_usage_bytes, EventKind, EventReceiver, EventSender, Phase,
    ProgressEvent, ProgressTracker,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};

/// Errors returned to callers of the manager.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid output options: {0}")]
    Validation(#[from] ValidationError),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("job {id} is {status}, not completed")]
    NotCompleted { id: String, status: JobStatus },

    #[error("destination {} is the job's own artifact", .0.display())]
    DestinationIsArtifact(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a job's pipeline stopped.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("audio download failed: {0}")]
    Audio(#[from] AssetDownloadError),

    #[error("encoding plan rejected: {0}")]
    Plan(#[from] PlanError),

    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::Extraction(ExtractionError::Cancelled)
                | PipelineError::Audio(AssetDownloadError::Cancelled)
                | PipelineError::Encode(EncodeError::Cancelled)
        )
    }
}

/// Reply to `submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub capabilities: SystemCapabilities,
}

/// Reply to `cancel` and `save`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAck {
    pub job_id: String,
    pub status: JobStatus,
}

/// A completed artifact opened for streaming.
#[derive(Debug)]
pub struct Download {
    pub file: tokio::fs::File,
    pub file_name: String,
    pub len: u64,
}

/// Tunables for the manager, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub scratch_dir: PathBuf,
    pub retention: Duration,
    pub save_cleanup_delay: Duration,
    pub extraction_weight: f64,
    pub encoding_weight: f64,
    pub event_capacity: usize,
}

impl From<&Config> for ManagerSettings {
    fn from(config: &Config) -> Self {
        Self {
            scratch_dir: config.service.scratch_dir.clone(),
            retention: Duration::from_secs(config.service.retention_secs),
            save_cleanup_delay: Duration::from_secs(config.service.save_cleanup_delay_secs),
            extraction_weight: config.progress.extraction_weight,
            encoding_weight: config.progress.encoding_weight,
            event_capacity: config.service.event_capacity,
        }
    }
}

/// External collaborators the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub probe: Arc<dyn CapabilityProbe>,
    pub renderer: Arc<dyn FrameRenderer>,
    pub fetcher: Arc<dyn AssetFetcher>,
    pub executor: Arc<dyn EncoderExecutor>,
}

impl Collaborators {
    /// Real processes and network access as configured.
    pub fn from_config(config: &Config) -> Self {
        let kill_timeout = Duration::from_secs(config.process.kill_timeout_secs);
        let tail = config.process.diagnostic_tail_bytes;
        Self {
            probe: Arc::new(SystemProbe::new(
                config.binaries.encoder.clone(),
                config.memory.clone(),
            )),
            renderer: Arc::new(CommandRenderer::new(
                config.binaries.renderer.clone(),
                kill_timeout,
                tail,
            )),
            fetcher: Arc::new(HttpAssetFetcher::default()),
            executor: Arc::new(ProcessRunner::new(
                config.binaries.encoder.clone(),
                kill_timeout,
                tail,
            )),
        }
    }
}

struct JobEntry {
    job: RenderJob,
    cancel: watch::Sender<bool>,
}

struct Inner {
    settings: ManagerSettings,
    jobs: RwLock<HashMap<String, JobEntry>>,
    events: EventSender,
    probe: Arc<dyn CapabilityProbe>,
    extraction: ExtractionOrchestrator,
    audio: AudioProcessor,
    executor: Arc<dyn EncoderExecutor>,
}

/// Registry and scheduler of render jobs. Cheap to clone.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(settings: ManagerSettings, collaborators: Collaborators) -> Self {
        let events = event_channel(settings.event_capacity);
        Self {
            inner: Arc::new(Inner {
                settings,
                jobs: RwLock::new(HashMap::new()),
                events,
                probe: collaborators.probe,
                extraction: ExtractionOrchestrator::new(collaborators.renderer),
                audio: AudioProcessor::new(collaborators.fetcher),
                executor: collaborators.executor,
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ManagerSettings::from(config), Collaborators::from_config(config))
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    /// Validate the options, snapshot capabilities and start the job.
    pub async fn submit(
        &self,
        composition: Composition,
        options: OutputOptions,
    ) -> Result<SubmitResponse, ServiceError> {
        options.validate()?;

        let capabilities = self.inner.probe.detect().await;
        let settings = &self.inner.settings;
        let job = RenderJob::new(
            Arc::new(composition),
            options,
            capabilities.clone(),
            ProgressTracker::new(settings.extraction_weight, settings.encoding_weight),
            &settings.scratch_dir,
        );
        let job_id = job.id.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        self.inner.jobs.write().await.insert(
            job_id.clone(),
            JobEntry {
                job,
                cancel: cancel_tx,
            },
        );
        tracing::info!(job_id = %job_id, memory_constrained = capabilities.is_memory_constrained, "job submitted");

        let manager = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move { manager.run_job(id, cancel_rx).await });

        Ok(SubmitResponse {
            job_id,
            capabilities,
        })
    }

    pub async fn status(&self, job_id: &str) -> Result<JobView, ServiceError> {
        self.inner
            .jobs
            .read()
            .await
            .get(job_id)
            .map(|entry| entry.job.view())
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))
    }

    /// All known jobs, oldest first.
    pub async fn list(&self) -> Vec<JobView> {
        let jobs = self.inner.jobs.read().await;
        let mut views: Vec<JobView> = jobs.values().map(|e| e.job.view()).collect();
        views.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then(a.id.cmp(&b.id)));
        views
    }

    /// Cancel an active job. Terminal jobs are left untouched.
    pub async fn cancel(&self, job_id: &str) -> Result<JobAck, ServiceError> {
        let memory = memory_usage_bytes();
        let mut jobs = self.inner.jobs.write().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))?;

        if entry.job.status.is_terminal() {
            tracing::debug!(job_id, status = %entry.job.status, "cancel ignored for finished job");
            return Ok(JobAck {
                job_id: job_id.to_string(),
                status: entry.job.status,
            });
        }

        entry.job.cancel();
        let _ = entry.cancel.send(true);
        self.emit(&entry.job, EventKind::Cancelled, memory);
        drop(jobs);

        tracing::info!(job_id, "job cancelled");
        self.schedule_cleanup(job_id.to_string(), self.inner.settings.retention);
        Ok(JobAck {
            job_id: job_id.to_string(),
            status: JobStatus::Cancelled,
        })
    }

    /// Copy the finished artifact to `destination` and schedule cleanup.
    ///
    /// A directory destination receives the artifact under its own file name. Copy
    /// failures are returned without touching the job, and a destination resolving to
    /// the artifact itself is refused.
    pub async fn save(&self, job_id: &str, destination: &Path) -> Result<PathBuf, ServiceError> {
        let source = self.completed_output(job_id).await?;

        let target = if tokio::fs::metadata(destination)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            match source.file_name() {
                Some(name) => destination.join(name),
                None => destination.to_path_buf(),
            }
        } else {
            destination.to_path_buf()
        };
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Copying a file onto itself truncates it
        if let Ok(resolved) = tokio::fs::canonicalize(&target).await {
            if resolved == tokio::fs::canonicalize(&source).await? {
                return Err(ServiceError::DestinationIsArtifact(target));
            }
        }

        let bytes = tokio::fs::copy(&source, &target).await?;
        tracing::info!(job_id, target = %target.display(), bytes, "artifact saved");

        self.schedule_cleanup(job_id.to_string(), self.inner.settings.save_cleanup_delay);
        Ok(target)
    }

    /// Open the finished artifact for streaming.
    pub async fn download(&self, job_id: &str) -> Result<Download, ServiceError> {
        let path = self.completed_output(job_id).await?;
        let file = tokio::fs::File::open(&path).await?;
        let len = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.bin", job_id));
        Ok(Download {
            file,
            file_name,
            len,
        })
    }

    /// Receive progress and terminal events for every job.
    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    async fn completed_output(&self, job_id: &str) -> Result<PathBuf, ServiceError> {
        let jobs = self.inner.jobs.read().await;
        let entry = jobs
            .get(job_id)
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))?;
        match (&entry.job.status, &entry.job.output_path) {
            (JobStatus::Completed, Some(path)) => Ok(path.clone()),
            (status, _) => Err(ServiceError::NotCompleted {
                id: job_id.to_string(),
                status: *status,
            }),
        }
    }

    fn emit(&self, job: &RenderJob, kind: EventKind, memory_usage_bytes: u64) {
        let snapshot = job.tracker.snapshot();
        let event = ProgressEvent {
            job_id: job.id.clone(),
            kind,
            progress: snapshot.overall,
            phase: job.phase_label().to_string(),
            time_remaining_secs: if kind.is_terminal() {
                None
            } else {
                snapshot.time_remaining_secs
            },
            memory_usage_bytes,
            error: job.error.clone(),
        };
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Apply a phase update if the job is still running.
    async fn report_progress(&self, job_id: &str, phase: Phase, percent: f64) {
        let memory = memory_usage_bytes();
        let mut jobs = self.inner.jobs.write().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };
        if !entry.job.status.is_active() {
            return;
        }
        entry.job.tracker.update(phase, percent);
        self.emit(&entry.job, EventKind::Progress, memory);
    }

    /// Move an active job to `status`; false when it is no longer active.
    async fn transition(&self, job_id: &str, status: JobStatus) -> bool {
        let mut jobs = self.inner.jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(entry) if entry.job.status.is_active() => {
                tracing::debug!(job_id, from = %entry.job.status, to = %status, "job transition");
                entry.job.status = status;
                true
            }
            _ => false,
        }
    }

    async fn run_job(self, job_id: String, cancel: watch::Receiver<bool>) {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(Phase, f64)>();
        let reporter = {
            let manager = self.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move {
                while let Some((phase, percent)) = progress_rx.recv().await {
                    manager.report_progress(&job_id, phase, percent).await;
                }
            })
        };

        let result = self.execute(&job_id, &progress_tx, cancel).await;
        drop(progress_tx);
        // Every queued update lands before the terminal event
        let _ = reporter.await;

        match result {
            Ok(output) => self.finish_completed(&job_id, output).await,
            Err(e) if e.is_cancellation() => {
                tracing::info!(job_id = %job_id, "pipeline stopped after cancellation");
            }
            Err(e) => self.finish_failed(&job_id, &e).await,
        }
    }

    async fn execute(
        &self,
        job_id: &str,
        progress: &mpsc::UnboundedSender<(Phase, f64)>,
        cancel: watch::Receiver<bool>,
    ) -> Result<PathBuf, PipelineError> {
        let (composition, options, capabilities, scratch_dir) = {
            let jobs = self.inner.jobs.read().await;
            let entry = jobs.get(job_id).ok_or(PipelineError::Cancelled)?;
            let job = &entry.job;
            (
                job.composition.clone(),
                job.options.clone(),
                job.capabilities.clone(),
                job.scratch_dir.clone(),
            )
        };

        if !self.transition(job_id, JobStatus::Extracting).await {
            return Err(PipelineError::Cancelled);
        }
        tokio::fs::create_dir_all(&scratch_dir).await?;

        let frames_dir = scratch_dir.join("frames");
        let audio_dir = scratch_dir.join("audio");
        let total_ms = resolve_duration_ms(&composition);
        let on_extraction = |percent: f64| {
            let _ = progress.send((Phase::Extraction, percent));
        };

        let (frames, audio) = tokio::try_join!(
            async {
                self.inner
                    .extraction
                    .extract(
                        composition.clone(),
                        &options,
                        &capabilities,
                        &frames_dir,
                        &on_extraction,
                        cancel.clone(),
                    )
                    .await
                    .map_err(PipelineError::from)
            },
            async {
                self.inner
                    .audio
                    .prepare(&composition, total_ms, &audio_dir, 1, cancel.clone())
                    .await
                    .map_err(PipelineError::from)
            },
        )?;

        if !self.transition(job_id, JobStatus::Encoding).await {
            return Err(PipelineError::Cancelled);
        }

        let output_path = scratch_dir.join(options.output_file_name());
        let passlog = scratch_dir.join("passlog");
        let plan = build_plan(&PlanRequest {
            caps: &capabilities,
            options: &options,
            frames: &frames,
            audio: &audio,
            output_path: &output_path,
            passlog_prefix: &passlog,
        })?;

        if let Some(entry) = self.inner.jobs.write().await.get_mut(job_id) {
            entry.job.plan = Some(plan.clone());
        }

        let on_encoding = |percent: f64| {
            let _ = progress.send((Phase::Encoding, percent));
        };
        for pass in &plan.passes {
            if *cancel.borrow() {
                return Err(PipelineError::Cancelled);
            }
            tracing::debug!(job_id, pass = pass.number, "running encoder pass");
            self.inner
                .executor
                .run_pass(pass, &on_encoding, cancel.clone())
                .await?;
        }

        let len = tokio::fs::metadata(&output_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if len == 0 {
            return Err(PipelineError::Encode(EncodeError::EmptyOutput {
                pass: plan.passes.last().map(|p| p.number).unwrap_or(1),
                path: output_path,
                tail: String::new(),
            }));
        }

        // Frames are no longer needed once the container exists
        if let Err(e) = tokio::fs::remove_dir_all(&frames_dir).await {
            tracing::debug!(job_id, error = %e, "could not remove frame directory");
        }

        Ok(output_path)
    }

    async fn finish_completed(&self, job_id: &str, output: PathBuf) {
        let memory = memory_usage_bytes();
        let mut jobs = self.inner.jobs.write().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };
        if !entry.job.status.is_active() {
            return;
        }
        entry.job.complete(output);
        self.emit(&entry.job, EventKind::Completed, memory);
        tracing::info!(
            job_id,
            elapsed_secs = entry.job.elapsed_secs(),
            "job completed"
        );
        drop(jobs);
        self.schedule_cleanup(job_id.to_string(), self.inner.settings.retention);
    }

    async fn finish_failed(&self, job_id: &str, error: &PipelineError) {
        let memory = memory_usage_bytes();
        let mut jobs = self.inner.jobs.write().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };
        if !entry.job.status.is_active() {
            return;
        }
        entry.job.fail(&error.to_string());
        self.emit(&entry.job, EventKind::Failed, memory);
        tracing::warn!(job_id, error = %error, "job failed");
        drop(jobs);
        self.schedule_cleanup(job_id.to_string(), self.inner.settings.retention);
    }

    /// Remove the job's scratch directory and evict its record after `delay`.
    fn schedule_cleanup(&self, job_id: String, delay: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.evict(&job_id).await;
        });
    }

    async fn evict(&self, job_id: &str) {
        let Some(entry) = self.inner.jobs.write().await.remove(job_id) else {
            return;
        };
        match tokio::fs::remove_dir_all(&entry.job.scratch_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(job_id, error = %e, "failed to remove scratch directory"),
        }
        tracing::debug!(job_id, "job evicted");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::tests::{audio_item, FakeFetcher};
    use crate::capability::FixedProbe;
    use crate::encode::runner::tests::FakeExecutor;
    use crate::extraction::tests::FakeRenderer;
    use crate::encode::EncoderPass;
    use crate::extraction::RenderRequest;
    use crate::progress::scale_into;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Renderer that reports one frame, waits for cancellation, then reports late.
    pub(crate) struct BlockingRenderer {
        pub started: Arc<tokio::sync::Notify>,
        pub finished: Arc<AtomicBool>,
    }

    impl BlockingRenderer {
        pub(crate) fn new() -> Self {
            Self {
                started: Arc::new(tokio::sync::Notify::new()),
                finished: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait::async_trait]
    impl FrameRenderer for BlockingRenderer {
        async fn render(
            &self,
            _request: &RenderRequest,
            on_rendered: &(dyn Fn(u64) + Send + Sync),
            mut cancel: watch::Receiver<bool>,
        ) -> Result<(), ExtractionError> {
            on_rendered(1);
            self.started.notify_one();
            crate::subprocess::cancelled(&mut cancel).await;
            on_rendered(5);
            self.finished.store(true, Ordering::SeqCst);
            Err(ExtractionError::Cancelled)
        }
    }

    /// Executor that reports half a pass, waits for cancellation, then reports late.
    pub(crate) struct BlockingExecutor {
        pub started: Arc<tokio::sync::Notify>,
        pub saw_cancel: Arc<AtomicBool>,
    }

    impl BlockingExecutor {
        pub(crate) fn new() -> Self {
            Self {
                started: Arc::new(tokio::sync::Notify::new()),
                saw_cancel: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait::async_trait]
    impl EncoderExecutor for BlockingExecutor {
        async fn run_pass(
            &self,
            pass: &EncoderPass,
            on_progress: &(dyn Fn(f64) + Send + Sync),
            mut cancel: watch::Receiver<bool>,
        ) -> Result<(), EncodeError> {
            on_progress(scale_into(pass.progress_start, pass.progress_end, 0.5));
            self.started.notify_one();
            crate::subprocess::cancelled(&mut cancel).await;
            self.saw_cancel.store(true, Ordering::SeqCst);
            on_progress(pass.progress_end);
            Err(EncodeError::Cancelled)
        }
    }

    pub(crate) fn settings(dir: &Path) -> ManagerSettings {
        ManagerSettings {
            scratch_dir: dir.to_path_buf(),
            retention: Duration::from_secs(600),
            save_cleanup_delay: Duration::from_secs(600),
            extraction_weight: 0.6,
            encoding_weight: 0.4,
            event_capacity: 1024,
        }
    }

    pub(crate) fn caps(constrained: bool) -> SystemCapabilities {
        SystemCapabilities {
            is_memory_constrained: constrained,
            total_memory_bytes: 16 << 30,
            available_memory_bytes: 8 << 30,
            ..SystemCapabilities::conservative()
        }
    }

    pub(crate) fn collaborators(
        renderer: Arc<dyn FrameRenderer>,
        executor: Arc<dyn EncoderExecutor>,
        fetcher: Arc<dyn AssetFetcher>,
        constrained: bool,
    ) -> Collaborators {
        Collaborators {
            probe: Arc::new(FixedProbe(caps(constrained))),
            renderer,
            fetcher,
            executor,
        }
    }

    pub(crate) fn fake_manager(dir: &Path) -> JobManager {
        JobManager::new(
            settings(dir),
            collaborators(
                Arc::new(FakeRenderer::new()),
                Arc::new(FakeExecutor::default()),
                Arc::new(FakeFetcher::default()),
                false,
            ),
        )
    }

    pub(crate) fn short_composition() -> Composition {
        Composition {
            items: vec![audio_item("music", "https://cdn/music.mp3", 0, Some(1_000))],
            timeline_duration_ms: Some(1_000),
            ..Composition::default()
        }
    }

    pub(crate) fn options() -> OutputOptions {
        OutputOptions {
            width: 1280,
            height: 720,
            fps: 10,
            quality: Default::default(),
            container: Default::default(),
            filename: "export".to_string(),
        }
    }

    /// Collect events for `job_id` until its terminal event.
    pub(crate) async fn events_until_terminal(
        rx: &mut EventReceiver,
        job_id: &str,
    ) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(event) if event.job_id == job_id => {
                        let terminal = event.kind.is_terminal();
                        events.push(event);
                        if terminal {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => panic!("event stream closed: {e}"),
                }
            }
        })
        .await
        .expect("job reaches a terminal state");
        events
    }

    #[tokio::test]
    async fn test_job_completes_with_artifact() {
        let dir = TempDir::new().unwrap();
        let manager = fake_manager(dir.path());
        let mut rx = manager.subscribe();

        let submitted = manager.submit(short_composition(), options()).await.unwrap();
        assert!(!submitted.capabilities.is_memory_constrained);
        let events = events_until_terminal(&mut rx, &submitted.job_id).await;

        assert_eq!(events.last().unwrap().kind, EventKind::Completed);
        let view = manager.status(&submitted.job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.progress, 100.0);
        assert_eq!(view.encoder.as_deref(), Some("libx264"));
        assert_eq!(view.two_pass, Some(false));

        let output = view.output_path.expect("completed job exposes output");
        assert_eq!(output.file_name().unwrap(), "export.mp4");
        assert!(std::fs::metadata(&output).unwrap().len() > 0);
        assert!(!dir.path().join(&submitted.job_id).join("frames").exists());
        assert!(dir.path().join(&submitted.job_id).join("audio").join("track-0.mp3").exists());
    }

    #[tokio::test]
    async fn test_progress_events_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let manager = fake_manager(dir.path());
        let mut rx = manager.subscribe();

        let job_id = manager.submit(short_composition(), options()).await.unwrap().job_id;
        let events = events_until_terminal(&mut rx, &job_id).await;

        assert!(events.len() > 2);
        assert!(events.windows(2).all(|w| w[0].progress <= w[1].progress));
        assert!(events.iter().any(|e| e.phase == "extraction"));
        assert!(events.iter().any(|e| e.phase == "encoding"));
        assert_eq!(events.iter().filter(|e| e.kind.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_creation() {
        let dir = TempDir::new().unwrap();
        let manager = fake_manager(dir.path());
        let mut bad = options();
        bad.width = 0;

        let err = manager.submit(short_composition(), bad).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let manager = fake_manager(dir.path());
        assert!(matches!(
            manager.status("missing").await,
            Err(ServiceError::JobNotFound(_))
        ));
        assert!(matches!(
            manager.cancel("missing").await,
            Err(ServiceError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_stops_progress_events() {
        let dir = TempDir::new().unwrap();
        let started = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let renderer = Arc::new(BlockingRenderer {
            started: started.clone(),
            finished: finished.clone(),
        });
        let manager = JobManager::new(
            settings(dir.path()),
            collaborators(
                renderer,
                Arc::new(FakeExecutor::default()),
                Arc::new(FakeFetcher::default()),
                false,
            ),
        );
        let mut rx = manager.subscribe();

        let job_id = manager.submit(short_composition(), options()).await.unwrap().job_id;
        started.notified().await;

        let ack = manager.cancel(&job_id).await.unwrap();
        assert_eq!(ack.status, JobStatus::Cancelled);
        assert_eq!(manager.status(&job_id).await.unwrap().status, JobStatus::Cancelled);

        let events = events_until_terminal(&mut rx, &job_id).await;
        assert_eq!(events.last().unwrap().kind, EventKind::Cancelled);

        // Let the renderer's late report and the pipeline wind down
        tokio::time::timeout(Duration::from_secs(5), async {
            while !finished.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        while let Ok(event) = rx.try_recv() {
            assert_ne!(event.job_id, job_id, "no events after cancellation");
        }
        assert_eq!(manager.status(&job_id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_encoding_stops_the_pass() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(BlockingExecutor::new());
        let manager = JobManager::new(
            settings(dir.path()),
            collaborators(
                Arc::new(FakeRenderer::new()),
                executor.clone(),
                Arc::new(FakeFetcher::default()),
                false,
            ),
        );
        let mut rx = manager.subscribe();

        let job_id = manager.submit(short_composition(), options()).await.unwrap().job_id;
        executor.started.notified().await;
        assert_eq!(manager.status(&job_id).await.unwrap().status, JobStatus::Encoding);

        manager.cancel(&job_id).await.unwrap();
        let events = events_until_terminal(&mut rx, &job_id).await;
        assert_eq!(events.last().unwrap().kind, EventKind::Cancelled);
        assert!(events.iter().all(|e| e.kind != EventKind::Completed));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !executor.saw_cancel.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("encoder pass observes cancellation");
        tokio::time::sleep(Duration::from_millis(100)).await;

        while let Ok(event) = rx.try_recv() {
            assert_ne!(event.job_id, job_id, "no events after cancellation");
        }
        let view = manager.status(&job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);
        assert!(view.output_path.is_none());
        assert!(view.error.is_none());
    }

    #[test]
    fn test_cancelled_audio_counts_as_cancellation() {
        assert!(PipelineError::Audio(AssetDownloadError::Cancelled).is_cancellation());
        assert!(PipelineError::Encode(EncodeError::Cancelled).is_cancellation());
        assert!(!PipelineError::Audio(AssetDownloadError::Empty("a.mp3".into())).is_cancellation());
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_noop() {
        let dir = TempDir::new().unwrap();
        let manager = fake_manager(dir.path());
        let mut rx = manager.subscribe();
        let job_id = manager.submit(short_composition(), options()).await.unwrap().job_id;
        events_until_terminal(&mut rx, &job_id).await;

        let ack = manager.cancel(&job_id).await.unwrap();
        assert_eq!(ack.status, JobStatus::Completed);
        assert_eq!(manager.status(&job_id).await.unwrap().status, JobStatus::Completed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_save_copies_artifact_and_keeps_status() {
        let dir = TempDir::new().unwrap();
        let manager = fake_manager(&dir.path().join("scratch"));
        let mut rx = manager.subscribe();
        let job_id = manager.submit(short_composition(), options()).await.unwrap().job_id;
        events_until_terminal(&mut rx, &job_id).await;

        let exports = dir.path().join("exports");
        std::fs::create_dir_all(&exports).unwrap();
        let saved = manager.save(&job_id, &exports).await.unwrap();

        assert_eq!(saved, exports.join("export.mp4"));
        assert!(std::fs::metadata(&saved).unwrap().len() > 0);
        assert_eq!(manager.status(&job_id).await.unwrap().status, JobStatus::Completed);

        let renamed = manager.save(&job_id, &exports.join("nested").join("final.mp4")).await.unwrap();
        assert!(renamed.exists());
    }

    #[tokio::test]
    async fn test_save_onto_artifact_leaves_it_intact() {
        let dir = TempDir::new().unwrap();
        let manager = fake_manager(&dir.path().join("scratch"));
        let mut rx = manager.subscribe();
        let job_id = manager.submit(short_composition(), options()).await.unwrap().job_id;
        events_until_terminal(&mut rx, &job_id).await;

        let artifact = manager.status(&job_id).await.unwrap().output_path.unwrap();
        let len = std::fs::metadata(&artifact).unwrap().len();
        assert!(len > 0);

        let same_file = manager.save(&job_id, &artifact).await;
        assert!(matches!(same_file, Err(ServiceError::DestinationIsArtifact(_))));
        let same_dir = manager.save(&job_id, artifact.parent().unwrap()).await;
        assert!(matches!(same_dir, Err(ServiceError::DestinationIsArtifact(_))));

        assert_eq!(std::fs::metadata(&artifact).unwrap().len(), len);
        assert_eq!(manager.status(&job_id).await.unwrap().status, JobStatus::Completed);
        assert_eq!(manager.download(&job_id).await.unwrap().len, len);
    }

    #[tokio::test]
    async fn test_save_and_download_require_completion() {
        let dir = TempDir::new().unwrap();
        let started = Arc::new(tokio::sync::Notify::new());
        let manager = JobManager::new(
            settings(dir.path()),
            collaborators(
                Arc::new(BlockingRenderer {
                    started: started.clone(),
                    finished: Arc::new(AtomicBool::new(false)),
                }),
                Arc::new(FakeExecutor::default()),
                Arc::new(FakeFetcher::default()),
                false,
            ),
        );
        let job_id = manager.submit(short_composition(), options()).await.unwrap().job_id;
        started.notified().await;

        assert!(matches!(
            manager.save(&job_id, dir.path()).await,
            Err(ServiceError::NotCompleted { .. })
        ));
        assert!(matches!(
            manager.download(&job_id).await,
            Err(ServiceError::NotCompleted { .. })
        ));
        manager.cancel(&job_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_constrained_job_runs_two_passes_in_order() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(FakeExecutor::default());
        let manager = JobManager::new(
            settings(dir.path()),
            collaborators(
                Arc::new(FakeRenderer::new()),
                executor.clone(),
                Arc::new(FakeFetcher::default()),
                true,
            ),
        );
        let mut rx = manager.subscribe();
        let job_id = manager.submit(short_composition(), options()).await.unwrap().job_id;
        let events = events_until_terminal(&mut rx, &job_id).await;

        assert_eq!(*executor.runs.lock().unwrap(), vec![1, 2]);
        assert_eq!(manager.status(&job_id).await.unwrap().two_pass, Some(true));

        // Pass 1 ends at half of the encoding slice: 60 + 0.4 * 50
        let pass_one_done = events
            .iter()
            .position(|e| (e.progress - 80.0).abs() < 1e-6)
            .expect("pass 1 reaches the end of its slice");
        assert!(events[..pass_one_done].iter().all(|e| e.progress <= 80.0 + 1e-6));
        assert!(events[pass_one_done..].iter().any(|e| e.progress > 80.0 + 1e-6));
    }

    #[tokio::test]
    async fn test_encoder_failure_marks_job_failed() {
        let dir = TempDir::new().unwrap();
        let manager = JobManager::new(
            settings(dir.path()),
            collaborators(
                Arc::new(FakeRenderer::new()),
                Arc::new(FakeExecutor {
                    fail_pass: Some(1),
                    ..FakeExecutor::default()
                }),
                Arc::new(FakeFetcher::default()),
                false,
            ),
        );
        let mut rx = manager.subscribe();
        let job_id = manager.submit(short_composition(), options()).await.unwrap().job_id;
        let events = events_until_terminal(&mut rx, &job_id).await;

        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Failed);
        assert!(last.error.as_deref().unwrap().contains("Unknown encoder"));

        let view = manager.status(&job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.output_path.is_none());
        assert!(view.error.unwrap().len() <= crate::job::MAX_ERROR_BYTES);
    }

    #[tokio::test]
    async fn test_audio_fetch_failure_fails_job() {
        let dir = TempDir::new().unwrap();
        let manager = JobManager::new(
            settings(dir.path()),
            collaborators(
                Arc::new(FakeRenderer::new()),
                Arc::new(FakeExecutor::default()),
                Arc::new(FakeFetcher {
                    failing: vec!["https://cdn/music.mp3".to_string()],
                    ..FakeFetcher::default()
                }),
                false,
            ),
        );
        let mut rx = manager.subscribe();
        let job_id = manager.submit(short_composition(), options()).await.unwrap().job_id;
        let events = events_until_terminal(&mut rx, &job_id).await;

        assert_eq!(events.last().unwrap().kind, EventKind::Failed);
        let view = manager.status(&job_id).await.unwrap();
        assert!(view.error.unwrap().contains("audio download failed"));
    }

    #[tokio::test]
    async fn test_scheduled_cleanup_evicts_job() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(dir.path());
        s.retention = Duration::from_millis(50);
        let manager = JobManager::new(
            s,
            collaborators(
                Arc::new(FakeRenderer::new()),
                Arc::new(FakeExecutor::default()),
                Arc::new(FakeFetcher::default()),
                false,
            ),
        );
        let mut rx = manager.subscribe();
        let job_id = manager.submit(short_composition(), options()).await.unwrap().job_id;
        events_until_terminal(&mut rx, &job_id).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(
            manager.status(&job_id).await,
            Err(ServiceError::JobNotFound(_))
        ));
        assert!(!dir.path().join(&job_id).exists());
    }

    #[tokio::test]
    async fn test_list_returns_all_jobs() {
        let dir = TempDir::new().unwrap();
        let manager = fake_manager(dir.path());
        let mut rx = manager.subscribe();
        let a = manager.submit(short_composition(), options()).await.unwrap().job_id;
        let b = manager.submit(short_composition(), options()).await.unwrap().job_id;
        events_until_terminal(&mut rx, &a).await;

        let ids: Vec<String> = manager.list().await.into_iter().map(|v| v.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&b));
    }
}
