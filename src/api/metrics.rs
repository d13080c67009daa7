//! Prometheus metrics and the /metrics endpoint.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

use super::AppState;
use crate::tasks::TaskStatus;
use crate::workers::model::WorkerStatus;

/// HTTP request latency buckets (seconds).
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0,
];

/// Global metrics container, registered once at first use.
static METRICS: Lazy<Option<ServiceMetrics>> = Lazy::new(|| match ServiceMetrics::new() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        tracing::error!(error = %e, "Failed to register metrics");
        None
    }
});

struct ServiceMetrics {
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    task_queue_size: GaugeVec,
    worker_count: GaugeVec,
}

impl ServiceMetrics {
    fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "http_requests_total",
                "Total HTTP requests",
                &["method", "endpoint", "status"]
            )?,
            http_request_duration_seconds: register_histogram_vec!(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "endpoint"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )?,
            task_queue_size: register_gauge_vec!(
                "task_queue_size",
                "Number of tasks in queue by status",
                &["status"]
            )?,
            worker_count: register_gauge_vec!(
                "worker_count",
                "Number of workers by status",
                &["status"]
            )?,
        })
    }
}

/// Record one finished HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    if let Some(metrics) = METRICS.as_ref() {
        let status = status.to_string();
        metrics
            .http_requests_total
            .with_label_values(&[method, path, &status])
            .inc();
        metrics
            .http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration.as_secs_f64());
    }
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}

/// GET /metrics — Prometheus text exposition.
///
/// Queue and worker gauges are refreshed from the store on each scrape.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(metrics) = METRICS.as_ref() {
        if let Ok(stats) = state.store.queue_stats().await {
            for status in TaskStatus::all() {
                let count = match status {
                    TaskStatus::Pending => stats.pending,
                    TaskStatus::Running => stats.running,
                    TaskStatus::Completed => stats.completed,
                    TaskStatus::Failed => stats.failed,
                    TaskStatus::Timeout => stats.timeout,
                    TaskStatus::Cancelled => stats.cancelled,
                };
                metrics
                    .task_queue_size
                    .with_label_values(&[status.as_str()])
                    .set(count as f64);
            }
        }
        if let Ok(workers) = state.store.list_workers(None, None).await {
            for status in [WorkerStatus::Idle, WorkerStatus::Busy, WorkerStatus::Offline] {
                let count = workers.iter().filter(|w| w.status == status).count();
                metrics
                    .worker_count
                    .with_label_values(&[status.as_str()])
                    .set(count as f64);
            }
        }
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {e}").into_bytes(),
            )
        }
    }
}
