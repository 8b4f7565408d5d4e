//! API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<CoordinatorState>`.

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, warn};

use crate::orchestrator::CycleOrchestrator;
use crate::registry::{ServiceRegistry, ServiceStatusEntry};
use crate::scheduler::{ScheduleUpdate, Scheduler};
use crate::types::{
    now_utc, CoordinatorError, CycleRecord, CycleSummary, KnownService, ScheduleConfig,
    WorkflowEvent,
};
use crate::workflow::history::PhaseStats;

const DEFAULT_CYCLE_LIMIT: u32 = 10;
const MAX_CYCLE_LIMIT: u32 = 500;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct CoordinatorState {
    pub registry: Arc<ServiceRegistry>,
    pub orchestrator: Arc<CycleOrchestrator>,
    pub scheduler: Arc<Scheduler>,
    /// Auto-discovery catalog.
    pub catalog: Vec<KnownService>,
    pub version: String,
}

pub type AppState = Arc<CoordinatorState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Maps a [`CoordinatorError`] to a JSON error response.
#[derive(Debug)]
pub struct ApiError(pub CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoordinatorError::Configuration(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }

        let body = match &self.0 {
            CoordinatorError::CycleAborted { cycle_id, source } => json!({
                "error": source.to_string(),
                "cycle_id": cycle_id,
                "status": "failed",
            }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Unwrap a JSON body, turning axum's rejection into a 400 with a JSON error.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(CoordinatorError::Configuration(rejection.body_text()).into()),
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: String,
    pub services_registered: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterRequest {
    pub service_name: Option<String>,
    pub port: Option<u16>,
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    pub status: &'static str,
    pub service: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForceRegisterResponse {
    pub status: &'static str,
    pub registered: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleChanged {
    pub message: &'static str,
    pub config: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleToggled {
    pub message: &'static str,
    pub next_run: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CyclesQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub summary: CycleSummary,
    pub events: Vec<WorkflowEvent>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "coordination",
        version: state.version.clone(),
        services_registered: state.registry.len().await,
    })
}

/// POST /register, POST /register_service
pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<RegisterResponse> {
    let req = json_body(body)?;
    let name = req
        .service_name
        .ok_or_else(|| CoordinatorError::Configuration("service_name is required".into()))?;
    let port = req
        .port
        .ok_or_else(|| CoordinatorError::Configuration("port is required".into()))?;

    let record = state.registry.register(&name, req.host.as_deref(), port).await?;
    Ok(Json(RegisterResponse {
        status: "registered",
        url: record.url(),
        service: record.name,
    }))
}

/// POST /force_register_all
pub async fn force_register_all(State(state): State<AppState>) -> ApiResult<ForceRegisterResponse> {
    let registered = state.registry.force_register_all(&state.catalog).await?;
    Ok(Json(ForceRegisterResponse {
        status: "completed",
        count: registered.len(),
        registered,
    }))
}

/// GET /service_status
pub async fn service_status(State(state): State<AppState>) -> ApiResult<Vec<ServiceStatusEntry>> {
    Ok(Json(state.registry.service_status(&state.catalog).await?))
}

/// POST /start_trading_cycle
pub async fn start_trading_cycle(State(state): State<AppState>) -> ApiResult<CycleSummary> {
    let started = now_utc();
    let summary = state.orchestrator.run_cycle().await?;
    if let Err(e) = state.scheduler.record_manual_run(started).await {
        warn!(error = %e, "Could not record manual run on the schedule");
    }
    Ok(Json(summary))
}

/// GET /schedule/status, GET /schedule/config
pub async fn get_schedule(State(state): State<AppState>) -> Json<ScheduleConfig> {
    Json(state.scheduler.config().await)
}

/// POST /schedule/config
pub async fn update_schedule(
    State(state): State<AppState>,
    body: Result<Json<ScheduleUpdate>, JsonRejection>,
) -> ApiResult<ScheduleChanged> {
    let update = json_body(body)?;
    let config = state.scheduler.update(update, now_utc()).await?;
    Ok(Json(ScheduleChanged {
        message: "Schedule updated",
        config,
    }))
}

/// POST /schedule/enable
///
/// The body is optional; any schedule fields it carries are applied along
/// with the switch.
pub async fn enable_schedule(State(state): State<AppState>, body: Bytes) -> ApiResult<ScheduleToggled> {
    let settings = if body.iter().all(u8::is_ascii_whitespace) {
        ScheduleUpdate::default()
    } else {
        serde_json::from_slice::<ScheduleUpdate>(&body)
            .map_err(|e| CoordinatorError::Configuration(format!("Invalid schedule body: {e}")))?
    };
    let config = state.scheduler.enable(settings, now_utc()).await?;
    Ok(Json(ScheduleToggled {
        message: "Schedule enabled",
        next_run: config.next_run,
    }))
}

/// POST /schedule/disable
pub async fn disable_schedule(State(state): State<AppState>) -> ApiResult<ScheduleToggled> {
    let config = state.scheduler.disable(now_utc()).await?;
    Ok(Json(ScheduleToggled {
        message: "Schedule disabled",
        next_run: config.next_run,
    }))
}

/// GET /trading_cycles?limit=N
pub async fn trading_cycles(
    State(state): State<AppState>,
    Query(query): Query<CyclesQuery>,
) -> ApiResult<Vec<CycleRecord>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CYCLE_LIMIT)
        .clamp(1, MAX_CYCLE_LIMIT);
    Ok(Json(state.orchestrator.engine().recent_cycles(limit).await?))
}

/// GET /latest_cycle
pub async fn latest_cycle(State(state): State<AppState>) -> ApiResult<Value> {
    let latest = state.orchestrator.engine().latest_cycle().await?;
    let body = match latest {
        Some(cycle) => serde_json::to_value(cycle).map_err(CoordinatorError::from)?,
        None => json!({ "status": "No cycles found" }),
    };
    Ok(Json(body))
}

/// GET /workflow/:cycle_id
pub async fn workflow_detail(
    State(state): State<AppState>,
    Path(cycle_id): Path<String>,
) -> ApiResult<WorkflowDetail> {
    let engine = state.orchestrator.engine();
    let summary = engine
        .summary(&cycle_id)
        .await?
        .ok_or_else(|| CoordinatorError::NotFound(format!("cycle {cycle_id}")))?;
    let events = engine.events(&cycle_id).await?;
    Ok(Json(WorkflowDetail { summary, events }))
}

/// GET /workflow/stats
pub async fn workflow_stats(State(state): State<AppState>) -> ApiResult<Vec<PhaseStats>> {
    Ok(Json(state.orchestrator.engine().phase_performance().await?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
