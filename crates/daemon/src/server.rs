//! HTTP surface for the export render daemon
//!
//! Exposes job submission, status, cancellation, artifact retrieval and a
//! server-sent event stream per job on top of a shared [`JobManager`].

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;

use crate::composition::{Composition, OutputOptions};
use crate::job::{JobStatus, JobView};
use crate::job_manager::{JobAck, JobManager, ServiceError, SubmitResponse};
use crate::progress::{EventKind, EventReceiver, ProgressEvent};

const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub composition: Composition,
    pub options: OutputOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRequest {
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub jobs: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// [`ServiceError`] rendered as a JSON error response.
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::NotCompleted { .. } => StatusCode::CONFLICT,
            ServiceError::DestinationIsArtifact(_) => StatusCode::BAD_REQUEST,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

async fn health(State(manager): State<JobManager>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        jobs: manager.list().await.len(),
    })
}

async fn submit_job(
    State(manager): State<JobManager>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let response = manager.submit(request.composition, request.options).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn list_jobs(State(manager): State<JobManager>) -> Json<Vec<JobView>> {
    Json(manager.list().await)
}

async fn job_status(
    State(manager): State<JobManager>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    Ok(Json(manager.status(&id).await?))
}

async fn cancel_job(
    State(manager): State<JobManager>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobAck>), ApiError> {
    let ack = manager.cancel(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

async fn save_job(
    State(manager): State<JobManager>,
    Path(id): Path<String>,
    Json(request): Json<SaveRequest>,
) -> Result<Json<SaveResponse>, ApiError> {
    let path = manager.save(&id, &request.destination).await?;
    Ok(Json(SaveResponse {
        job_id: id,
        status: JobStatus::Completed,
        path,
    }))
}

async fn download_job(
    State(manager): State<JobManager>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let download = manager.download(&id).await?;

    let chunks = stream::unfold(download.file, |mut file| async move {
        let mut buf = vec![0u8; DOWNLOAD_CHUNK_BYTES];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok::<_, std::io::Error>(buf), file))
            }
            Err(e) => Some((Err(e), file)),
        }
    });

    let disposition = format!(
        "attachment; filename=\"{}\"",
        download.file_name.replace('"', "")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, download.len.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(chunks),
    )
        .into_response())
}

async fn job_events(
    State(manager): State<JobManager>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Subscribe first so a terminal event between the two calls is not lost
    let rx = manager.subscribe();
    let view = manager.status(&id).await?;

    let initial = snapshot_event(&view);
    let finished = initial.kind.is_terminal();
    let state = EventStreamState {
        manager,
        rx,
        job_id: id,
        pending: Some(initial),
        finished,
    };

    Ok(Sse::new(stream::unfold(state, next_event)).keep_alive(KeepAlive::default()))
}

struct EventStreamState {
    manager: JobManager,
    rx: EventReceiver,
    job_id: String,
    pending: Option<ProgressEvent>,
    finished: bool,
}

async fn next_event(
    mut state: EventStreamState,
) -> Option<(Result<Event, Infallible>, EventStreamState)> {
    if let Some(event) = state.pending.take() {
        return Some((Ok(to_sse(&event)), state));
    }
    if state.finished {
        return None;
    }
    loop {
        match state.rx.recv().await {
            Ok(event) if event.job_id == state.job_id => {
                state.finished = event.kind.is_terminal();
                return Some((Ok(to_sse(&event)), state));
            }
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(job_id = %state.job_id, skipped, "event subscriber lagged");
                // The terminal event may be among the skipped ones
                match state.manager.status(&state.job_id).await {
                    Ok(view) if view.status.is_terminal() => {
                        state.finished = true;
                        return Some((Ok(to_sse(&snapshot_event(&view))), state));
                    }
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

/// Event describing a job's state at the moment a subscriber connects.
fn snapshot_event(view: &JobView) -> ProgressEvent {
    let kind = match view.status {
        JobStatus::Completed => EventKind::Completed,
        JobStatus::Failed => EventKind::Failed,
        JobStatus::Cancelled => EventKind::Cancelled,
        _ => EventKind::Progress,
    };
    ProgressEvent {
        job_id: view.id.clone(),
        kind,
        progress: view.progress,
        phase: view.phase.clone(),
        time_remaining_secs: view.time_remaining_secs,
        memory_usage_bytes: crate::progress::memory_usage_bytes(),
        error: view.error.clone(),
    }
}

fn to_sse(event: &ProgressEvent) -> Event {
    Event::default()
        .event(event.kind.as_str())
        .json_data(event)
        .unwrap_or_else(|e| Event::default().comment(format!("unserializable event: {}", e)))
}

/// Creates the axum Router with every job endpoint
pub fn create_router(manager: JobManager) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/save", post(save_job))
        .route("/jobs/:id/download", get(download_job))
        .route("/jobs/:id/events", get(job_events))
        .with_state(manager)
}

/// Serves the router on `listener` until `shutdown` resolves
///
/// # Arguments
/// * `manager` - Job registry shared by every request
/// * `listener` - Already bound listener
/// * `shutdown` - Future that ends the server gracefully when it completes
pub async fn run_server<F>(
    manager: JobManager,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(manager);
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "http server listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::BindError)?;
    Ok(())
}
