//! Health, queue stats, and service metadata endpoints.

use std::time::Instant;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use super::{ApiError, AppState};
use crate::workers::model::WorkerStatus;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/queue/stats", get(queue_stats))
        .route("/", get(root))
}

/// GET /health
///
/// Probes the database and summarizes workers and the queue. Overall status
/// is `unhealthy` without a database, `degraded` without workers.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_start = Instant::now();
    let database = match state.store.ping().await {
        Ok(()) => serde_json::json!({
            "connected": true,
            "latency_ms": db_start.elapsed().as_secs_f64() * 1000.0,
        }),
        Err(e) => serde_json::json!({
            "connected": false,
            "error": e.to_string(),
        }),
    };
    let db_connected = database["connected"].as_bool().unwrap_or(false);

    let workers = match state.store.list_workers(None, None).await {
        Ok(workers) => {
            let idle = workers
                .iter()
                .filter(|w| w.status == WorkerStatus::Idle)
                .count();
            let busy = workers
                .iter()
                .filter(|w| w.status == WorkerStatus::Busy)
                .count();
            let offline = workers
                .iter()
                .filter(|w| w.status == WorkerStatus::Offline)
                .count();
            serde_json::json!({
                "total": workers.len(),
                "idle": idle,
                "busy": busy,
                "offline": offline,
            })
        }
        Err(e) => serde_json::json!({"error": e.to_string()}),
    };
    let total_workers = workers["total"].as_i64().unwrap_or(0);

    let queue = match state.store.queue_stats().await {
        Ok(stats) => serde_json::to_value(&stats).unwrap_or_default(),
        Err(e) => serde_json::json!({"error": e.to_string()}),
    };

    let status = if !db_connected {
        "unhealthy"
    } else if total_workers == 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now(),
        "database": database,
        "workers": workers,
        "queue": queue,
    }))
}

/// GET /queue/stats
async fn queue_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.store.queue_stats().await?;
    Ok(Json(serde_json::json!({
        "pending": stats.pending,
        "running": stats.running,
        "completed": stats.completed,
        "failed": stats.failed,
        "timeout": stats.timeout,
        "cancelled": stats.cancelled,
        "total": stats.total(),
        "success_rate": stats.success_rate(),
    })))
}

/// GET /
async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "AIOpsLab Task Execution API",
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/health",
        "metrics": "/metrics",
    }))
}
