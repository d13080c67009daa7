//! HTTP surface — thin translation layer over the store and worker manager.

pub mod conversations;
pub mod health;
pub mod metrics;
pub mod tasks;
pub mod workers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::StoreError;
use crate::store::Store;
use crate::workers::WorkerManager;

/// Shared state for all handlers. Holds no per-request data.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub manager: Arc<WorkerManager>,
    pub settings: Settings,
    /// Set while the service drains; refuses new tasks and claims.
    pub draining: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, manager: Arc<WorkerManager>, settings: Settings) -> Self {
        Self {
            store,
            manager,
            settings,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }
}

/// API error with a stable kind, rendered as a structured JSON body.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::Unavailable(_) => "ServiceUnavailable",
            Self::Internal(_) => "InternalServerError",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Validation(m)
            | Self::NotFound(m)
            | Self::Conflict(m)
            | Self::Unavailable(m)
            | Self::Internal(m) => m,
        }
    }

    /// Refusal used while the service drains.
    pub fn shutdown_in_progress() -> Self {
        Self::Unavailable("Shutdown in progress".into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        if matches!(self, Self::Internal(_)) {
            tracing::error!(request_id, error = %self.message(), "Request failed");
        }
        let body = serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.message(),
            },
            "request_id": request_id,
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => Self::NotFound(e.to_string()),
            StoreError::Conflict(m) => Self::Conflict(m),
            StoreError::Validation(m) => Self::Validation(m),
            StoreError::Transient(m) => Self::Unavailable(m),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Echo or assign an `X-Request-ID` header and record request metrics.
async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let start = std::time::Instant::now();
    let mut response = next.run(request).await;
    metrics::record_http_request(&method, &path, response.status().as_u16(), start.elapsed());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(metrics::routes())
        .nest(
            "/api/v1",
            Router::new()
                .merge(tasks::routes())
                .merge(workers::routes())
                .merge(conversations::routes()),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
