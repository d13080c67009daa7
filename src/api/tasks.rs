//! Task endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::tasks::{LogLevel, NewTask, Page, TaskFilter, TaskStatus};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/stats", get(task_stats))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/logs", get(task_logs))
}

/// POST /api/v1/tasks
async fn create_task(
    State(state): State<AppState>,
    Json(new): Json<NewTask>,
) -> Result<impl IntoResponse, ApiError> {
    if state.is_draining() {
        return Err(ApiError::shutdown_in_progress());
    }
    if new.problem_id.trim().is_empty() {
        return Err(ApiError::Validation("problem_id must not be empty".into()));
    }

    let (parameters, backend_type, priority) = new.resolve(&state.settings);
    let task = state
        .store
        .insert_task(&new.problem_id, &parameters, &backend_type, priority)
        .await?;
    state
        .store
        .append_log(
            task.id,
            LogLevel::Info,
            "Task created",
            serde_json::json!({"problem_id": task.problem_id, "priority": task.priority}),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    problem_id: Option<String>,
    worker_id: Option<String>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

/// GET /api/v1/tasks
async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            TaskStatus::parse(s)
                .ok_or_else(|| ApiError::Validation(format!("Unknown task status '{s}'")))
        })
        .transpose()?;

    let filter = TaskFilter {
        status,
        problem_id: params.problem_id,
        worker_id: params.worker_id,
    };
    let page = Page {
        page: params.page.max(1),
        page_size: params.page_size.clamp(1, 100),
    };
    let (tasks, total) = state.store.list_tasks(&filter, page).await?;

    Ok(Json(serde_json::json!({
        "tasks": tasks,
        "total": total,
        "page": page.page,
        "page_size": page.page_size,
    })))
}

/// GET /api/v1/tasks/{id}
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {id} not found")))?;
    Ok(Json(task))
}

/// POST /api/v1/tasks/{id}/cancel
async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.store.cancel_task(id).await?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct LogParams {
    level: Option<String>,
    #[serde(default = "default_log_limit")]
    limit: u32,
}

fn default_log_limit() -> u32 {
    100
}

/// GET /api/v1/tasks/{id}/logs
async fn task_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<LogParams>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_task(id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Task {id} not found")));
    }
    let level = params
        .level
        .as_deref()
        .map(|s| {
            LogLevel::parse(s)
                .ok_or_else(|| ApiError::Validation(format!("Unknown log level '{s}'")))
        })
        .transpose()?;

    let logs = state
        .store
        .get_logs(id, level, params.limit.clamp(1, 1000))
        .await?;
    Ok(Json(serde_json::json!({"task_id": id, "logs": logs})))
}

/// GET /api/v1/tasks/stats
async fn task_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.store.task_stats().await?;
    Ok(Json(stats))
}
