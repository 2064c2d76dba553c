//! Export Render Daemon
//!
//! Background service that turns a timeline composition into a video file: frames are
//! rendered by an external renderer, audio is fetched and mixed, and the result is
//! encoded with an ffmpeg compatible encoder chosen from the host's capabilities.

pub mod audio;
pub mod capability;
pub mod composition;
pub mod encode;
pub mod extraction;
pub mod job;
pub mod job_manager;
pub mod logging;
pub mod progress;
pub mod server;
pub mod service;
pub mod startup;
pub mod subprocess;

pub use export_render_config as config;
pub use export_render_config::Config;

pub use audio::{AssetDownloadError, AssetFetcher, AudioPlan, AudioProcessor, HttpAssetFetcher};
pub use capability::{CapabilityProbe, SystemCapabilities, SystemProbe};
pub use composition::{Composition, CompositionItem, OutputOptions, ValidationError};
pub use encode::{build_plan, Codec, EncodeError, EncoderExecutor, EncodingPlan, ProcessRunner};
pub use extraction::{CommandRenderer, ExtractionError, ExtractionOrchestrator, FrameRenderer};
pub use job::{JobStatus, JobView};
pub use job_manager::{Collaborators, JobManager, ManagerSettings, ServiceError, SubmitResponse};
pub use logging::init_logging;
pub use progress::{EventKind, ProgressEvent, ProgressTracker};
pub use server::{create_router, run_server, ServerError};
pub use service::{Service, ServiceStartError};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError};
