// HTTP API front end
//
//   POST   /vms                      create
//   GET    /vms                      list
//   GET    /vms/{name}               get
//   PATCH  /vms/{name}               update settings
//   DELETE /vms/{name}               delete
//   POST   /vms/{name}/run|stop|pause|resume|clone
//   POST   /pull                     pull in the background (or wait)
//   GET    /pull/jobs                pull progress
//   GET    /images, /images/{ref}    local image index
//   POST   /prune
//   GET    /ipsw                     latest restore image URL
//   GET    /metrics, /health
//
// Every route takes an optional `?location=` for the storage location.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::metrics;
use crate::registry::PullError;
use crate::units::parse_size;
use crate::vm::config::{OsKind, Resolution, VmConfigUpdate};
use crate::vm::controller::{Controller, CreateOptions, RunOptions, VmSource};
use crate::vm::display::DisplayError;
use crate::vm::error::VmError;
use crate::vm::session::SharedDirectory;

#[derive(Clone)]
pub struct AppState {
    controller: Arc<Controller>,
    /// Cancelled on shutdown; background pulls observe it.
    shutdown: CancelToken,
}

impl AppState {
    pub fn new(controller: Arc<Controller>, shutdown: CancelToken) -> Self {
        Self {
            controller,
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/vms", post(create_vm).get(list_vms))
        .route("/vms/{name}", get(get_vm).patch(update_vm).delete(delete_vm))
        .route("/vms/{name}/run", post(run_vm))
        .route("/vms/{name}/stop", post(stop_vm))
        .route("/vms/{name}/pause", post(pause_vm))
        .route("/vms/{name}/resume", post(resume_vm))
        .route("/vms/{name}/clone", post(clone_vm))
        .route("/pull", post(pull_image))
        .route("/pull/jobs", get(pull_jobs))
        .route("/images", get(list_images))
        .route("/images/{reference}", get(get_image))
        .route("/prune", post(prune))
        .route("/ipsw", get(ipsw))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
pub async fn serve(controller: Arc<Controller>, addr: SocketAddr, shutdown: CancelToken) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let app = router(AppState::new(controller, shutdown.clone()));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server to {}", addr))?;
    info!("Starting API server on {}", listener.local_addr().unwrap_or(addr));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    info!("API server stopped");
    Ok(())
}

// ---- errors ------------------------------------------------------------------

pub struct ApiError(VmError);

impl From<VmError> for ApiError {
    fn from(e: VmError) -> Self {
        ApiError(e)
    }
}

impl From<PullError> for ApiError {
    fn from(e: PullError) -> Self {
        ApiError(VmError::Pull(e))
    }
}

fn status_for(err: &VmError) -> StatusCode {
    match err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        VmError::Busy(_) => StatusCode::LOCKED,
        e if e.is_state_conflict() => StatusCode::CONFLICT,
        VmError::InvalidName { .. }
        | VmError::InvalidConfigValue(_)
        | VmError::ResizeTooSmall { .. }
        | VmError::NotADirectory(_)
        | VmError::NotWritable(_) => StatusCode::BAD_REQUEST,
        VmError::StopTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        VmError::Display(DisplayError::PortInUse { .. } | DisplayError::PortMismatch { .. }) => {
            StatusCode::CONFLICT
        }
        VmError::Pull(pull) => match pull {
            PullError::InvalidImageFormat { .. } => StatusCode::BAD_REQUEST,
            PullError::ImageNotFound(_) => StatusCode::NOT_FOUND,
            PullError::TokenFetchFailed(_)
            | PullError::ManifestFetchFailed(_)
            | PullError::LayerDownloadFailed { .. }
            | PullError::MissingUncompressedSizeAnnotation => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        VmError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(VmError::InvalidConfigValue(message.into()))
}

/// Parse an optional JSON body; an empty body yields the default.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid request body: {}", e)))
}

// ---- request bodies -----------------------------------------------------------

/// A size given as bytes or as a size string such as "20GB".
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Size {
    Bytes(u64),
    Text(String),
}

impl Size {
    fn bytes(&self) -> ApiResult<u64> {
        match self {
            Size::Bytes(n) => Ok(*n),
            Size::Text(s) => parse_size(s).map_err(|e| bad_request(e.to_string())),
        }
    }
}

fn size(value: &Option<Size>) -> ApiResult<Option<u64>> {
    value.as_ref().map(Size::bytes).transpose()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LocationQuery {
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CreateRequest {
    name: String,
    os: Option<OsKind>,
    cpu_count: Option<u32>,
    memory: Option<Size>,
    disk_size: Option<Size>,
    display: Option<Resolution>,
    location: Option<String>,
    image: Option<String>,
    installer: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RunRequest {
    display: bool,
    port: Option<u16>,
    iso: Option<PathBuf>,
    shared_directories: Vec<String>,
    image: Option<String>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            display: true,
            port: None,
            iso: None,
            shared_directories: Vec::new(),
            image: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UpdateRequest {
    cpu_count: Option<u32>,
    memory: Option<Size>,
    disk_size: Option<Size>,
    display: Option<Resolution>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CloneRequest {
    destination: String,
    destination_location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PullRequest {
    reference: String,
    name: Option<String>,
    location: Option<String>,
    wait: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PruneRequest {
    all: bool,
}

// ---- VM handlers ------------------------------------------------------------------

async fn create_vm(State(state): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let request: CreateRequest = parse_body(&body)?;
    if request.name.is_empty() {
        return Err(bad_request("name is required"));
    }
    let source = match (request.image, request.installer) {
        (Some(_), Some(_)) => return Err(bad_request("image and installer are mutually exclusive")),
        (Some(image), None) => VmSource::Image(image),
        (None, Some(installer)) => VmSource::Installer(installer),
        (None, None) => VmSource::Blank,
    };
    let options = CreateOptions {
        os: request.os,
        cpu_count: request.cpu_count,
        memory_size: size(&request.memory)?,
        disk_size: size(&request.disk_size)?,
        display: request.display,
        location: request.location,
        source,
    };
    let details = state
        .controller
        .create(&request.name, options, &state.shutdown)
        .await?;
    Ok((StatusCode::CREATED, Json(details)))
}

async fn list_vms(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.list().await?))
}

async fn get_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LocationQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.get(&name, query.location.as_deref()).await?))
}

async fn update_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LocationQuery>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: UpdateRequest = parse_body(&body)?;
    let update = VmConfigUpdate {
        cpu_count: request.cpu_count,
        memory_size: size(&request.memory)?,
        disk_size: size(&request.disk_size)?,
        display: request.display,
    };
    let config = state
        .controller
        .update_settings(&name, query.location.as_deref(), &update)
        .await?;
    Ok(Json(config))
}

async fn delete_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LocationQuery>,
) -> ApiResult<impl IntoResponse> {
    state.controller.delete(&name, query.location.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LocationQuery>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: RunRequest = parse_body(&body)?;
    let shared_directories = request
        .shared_directories
        .iter()
        .map(|s| s.parse::<SharedDirectory>())
        .collect::<Result<Vec<_>, _>>()?;
    let options = RunOptions {
        display: request.display,
        display_port: request.port,
        open_client: false,
        iso: request.iso,
        shared_directories,
        location: query.location,
        image: request.image,
    };
    Ok(Json(state.controller.run(&name, options, &state.shutdown).await?))
}

async fn stop_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LocationQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.stop(&name, query.location.as_deref()).await?))
}

async fn pause_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LocationQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.pause(&name, query.location.as_deref()).await?))
}

async fn resume_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LocationQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.resume(&name, query.location.as_deref()).await?))
}

async fn clone_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LocationQuery>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: CloneRequest = parse_body(&body)?;
    if request.destination.is_empty() {
        return Err(bad_request("destination is required"));
    }
    let details = state
        .controller
        .clone_vm(
            &name,
            &request.destination,
            query.location.as_deref(),
            request.destination_location.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(details)))
}

// ---- image handlers -------------------------------------------------------------

async fn pull_image(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let request: PullRequest = parse_body(&body)?;
    // reject malformed references before going to the background
    let reference = crate::registry::ImageReference::parse(&request.reference)?;
    state.controller.puller()?;

    if request.wait {
        let (record, vm) = state
            .controller
            .pull(
                &request.reference,
                request.name.as_deref(),
                request.location.as_deref(),
                &state.shutdown,
            )
            .await?;
        return Ok(Json(json!({ "image": record, "vm": vm })).into_response());
    }

    let controller = state.controller.clone();
    let cancel = state.shutdown.clone();
    tokio::spawn(async move {
        let result = controller
            .pull(
                &request.reference,
                request.name.as_deref(),
                request.location.as_deref(),
                &cancel,
            )
            .await;
        if let Err(e) = result {
            warn!(image = %request.reference, error = %e, "Background pull failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "reference": reference.to_string(), "status": "started" })),
    )
        .into_response())
}

async fn pull_jobs(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.puller()?.jobs()))
}

async fn list_images(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.puller()?.images().await?))
}

async fn get_image(State(state): State<AppState>, Path(reference): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.puller()?.image(&reference).await?))
}

async fn prune(State(state): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let request: PruneRequest = parse_body(&body)?;
    Ok(Json(state.controller.puller()?.prune(request.all).await?))
}

async fn ipsw(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let url = state.controller.latest_restore_image_url().await?;
    Ok(Json(json!({ "url": url })))
}

// ---- observability ----------------------------------------------------------------

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}
