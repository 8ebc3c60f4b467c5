use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use tagstream_core::reader::{PowerLevel, Reader, DEFAULT_PORT, DEFAULT_READ_INTERVAL_MS};
use tagstream_llrp::TagReport;
use tagstream_pipeline::{PipelineStats, ReadPipeline};
use tagstream_session::{BatchSummary, OverallStatus, ReaderHealth, SessionError, SessionManager};

/// Timeout for a manually submitted batch.
const BATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub pipeline: Arc<ReadPipeline>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/readers", post(register_reader))
        .route("/api/v1/readers/{reader_id}/batch", post(process_batch))
        .route("/api/v1/readers/{reader_id}", axum::routing::delete(deregister_reader))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ReaderSpec {
    pub name: String,
    pub ip_address: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_power_level")]
    pub power_level: PowerLevel,
    #[serde(default = "default_read_interval")]
    pub read_interval_ms: u64,
    #[serde(default)]
    pub filtering_enabled: Option<bool>,
    #[serde(default)]
    pub additional_params: HashMap<String, String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_power_level() -> PowerLevel {
    PowerLevel::Medium
}

fn default_read_interval() -> u64 {
    DEFAULT_READ_INTERVAL_MS
}

#[derive(Debug, Deserialize)]
pub struct RawReport {
    pub epc: String,
    pub peak_rssi: Option<i8>,
}

#[derive(Serialize)]
pub struct BatchResponse {
    #[serde(flatten)]
    pub summary: BatchSummary,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub overall: OverallStatus,
    pub active_readers: usize,
    pub readers: HashMap<String, ReaderHealth>,
    pub pipeline: PipelineStats,
    pub timestamp: String,
}

/// POST /api/v1/readers: validate a reader spec and hand it to the
/// session manager.
pub async fn register_reader(
    State(state): State<AppState>,
    Json(spec): Json<ReaderSpec>,
) -> Result<Json<Reader>, ApiError> {
    let mut reader = Reader::new(
        &spec.name,
        spec.ip_address,
        spec.port,
        spec.power_level,
        spec.read_interval_ms,
    )
    .map_err(SessionError::Validation)?;
    if let Some(filtering_enabled) = spec.filtering_enabled {
        reader.filtering_enabled = filtering_enabled;
    }
    reader.additional_params = spec.additional_params;

    let registered = state.manager.register(reader).await?;
    Ok(Json(registered))
}

/// DELETE /api/v1/readers/{reader_id}
pub async fn deregister_reader(
    State(state): State<AppState>,
    Path(reader_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.deregister(&reader_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/readers/{reader_id}/batch: manual fan-in for raw
/// reports, used by admin tests and replay.
pub async fn process_batch(
    State(state): State<AppState>,
    Path(reader_id): Path<String>,
    Json(reports): Json<Vec<RawReport>>,
) -> Result<Json<BatchResponse>, ApiError> {
    let reports: Vec<TagReport> = reports
        .into_iter()
        .map(|raw| TagReport {
            epc: raw.epc,
            peak_rssi: raw.peak_rssi,
        })
        .collect();

    let summary = tokio::time::timeout(
        BATCH_TIMEOUT,
        state.manager.process_batch(&reader_id, reports),
    )
    .await
    .map_err(|_| ApiError::Timeout)??;

    Ok(Json(BatchResponse {
        summary,
        timestamp: Utc::now().to_rfc3339(),
    }))
}

/// GET /health: overall and per-reader health plus pipeline counters.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let service = state.manager.health_all().await;
    Json(HealthResponse {
        overall: service.overall,
        active_readers: service.active_readers,
        readers: service.readers,
        pipeline: state.pipeline.stats(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[derive(Debug)]
pub enum ApiError {
    Session(SessionError),
    Timeout,
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Session(SessionError::NotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("reader {id} not found"))
            }
            ApiError::Session(SessionError::AlreadyRegistered(id)) => (
                StatusCode::CONFLICT,
                format!("reader {id} already registered"),
            ),
            ApiError::Session(SessionError::HealthCheckFailed) => (
                StatusCode::BAD_REQUEST,
                "reader failed health check".to_string(),
            ),
            ApiError::Session(SessionError::Validation(e)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            ApiError::Session(SessionError::Connect(e)) => {
                (StatusCode::BAD_GATEWAY, format!("connect failed: {e}"))
            }
            ApiError::Timeout => (
                StatusCode::REQUEST_TIMEOUT,
                "batch processing timeout".to_string(),
            ),
        };

        warn!(%status, error = %message, "admin request failed");
        let body = Json(serde_json::json!({ "error": message }));
        (status, body).into_response()
    }
}
