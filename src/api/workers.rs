//! Worker endpoints, including internal pool control.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::workers::model::{Heartbeat, WorkerRegistration, WorkerStatus};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/workers/register", post(register_worker))
        .route("/workers", get(list_workers))
        .route("/workers/internal/status", get(internal_status))
        .route("/workers/internal/scale", post(internal_scale))
        .route("/workers/internal/start", post(internal_start))
        .route("/workers/internal/stop", post(internal_stop))
        .route("/workers/{id}", get(get_worker))
        .route("/workers/{id}/heartbeat", post(worker_heartbeat))
        .route("/workers/{id}/claim", post(claim_task))
        .route("/workers/{id}/stats", get(worker_stats))
        .route(
            "/workers/{id}/tasks/{task_id}/complete",
            post(complete_task),
        )
        .route("/workers/{id}/tasks/{task_id}/fail", post(fail_task))
}

/// POST /api/v1/workers/register
async fn register_worker(
    State(state): State<AppState>,
    Json(reg): Json<WorkerRegistration>,
) -> Result<impl IntoResponse, ApiError> {
    let worker = state.store.upsert_worker(&reg).await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

#[derive(Debug, Deserialize)]
struct WorkerListParams {
    status: Option<String>,
    backend_type: Option<String>,
}

/// GET /api/v1/workers
async fn list_workers(
    State(state): State<AppState>,
    Query(params): Query<WorkerListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            WorkerStatus::parse(s)
                .ok_or_else(|| ApiError::Validation(format!("Unknown worker status '{s}'")))
        })
        .transpose()?;

    let workers = state
        .store
        .list_workers(status, params.backend_type.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "workers": workers,
        "total": workers.len(),
    })))
}

/// GET /api/v1/workers/{id}
async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let worker = state
        .store
        .get_worker(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Worker {id} not found")))?;
    Ok(Json(worker))
}

/// POST /api/v1/workers/{id}/heartbeat
async fn worker_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(beat): Json<Heartbeat>,
) -> Result<impl IntoResponse, ApiError> {
    let worker = state.store.heartbeat(&id, &beat).await?;
    Ok(Json(worker))
}

/// POST /api/v1/workers/{id}/claim
///
/// Returns the claimed task, or `null` when nothing is claimable.
async fn claim_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.is_draining() {
        return Err(ApiError::shutdown_in_progress());
    }
    let task = state.store.claim_next(&id).await?;
    Ok(Json(task))
}

/// POST /api/v1/workers/{id}/tasks/{task_id}/complete
async fn complete_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, Uuid)>,
    Json(result): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.store.complete_task(task_id, &id, result).await?;
    Ok(Json(task))
}

/// POST /api/v1/workers/{id}/tasks/{task_id}/fail
async fn fail_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, Uuid)>,
    Json(error_details): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.store.fail_task(task_id, &id, error_details).await?;
    Ok(Json(task))
}

/// GET /api/v1/workers/{id}/stats
async fn worker_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.store.worker_stats(&id).await?;
    Ok(Json(stats))
}

// ── Internal pool control ───────────────────────────────────────────

/// GET /api/v1/workers/internal/status
async fn internal_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.status().await)
}

#[derive(Debug, Deserialize)]
struct ScaleParams {
    num_workers: usize,
}

/// POST /api/v1/workers/internal/scale?num_workers=N
async fn internal_scale(
    State(state): State<AppState>,
    Query(params): Query<ScaleParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (previous, current) = state.manager.set_count(params.num_workers).await?;
    Ok(Json(serde_json::json!({
        "previous_workers": previous,
        "current_workers": current,
        "status": "scaled",
    })))
}

/// POST /api/v1/workers/internal/start
async fn internal_start(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let workers = state.manager.start().await?;
    Ok(Json(serde_json::json!({
        "status": "started",
        "workers": workers,
    })))
}

/// POST /api/v1/workers/internal/stop
async fn internal_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.manager.stop().await;
    Json(serde_json::json!({
        "status": "stopped",
        "message": "All internal workers stopped",
    }))
}
