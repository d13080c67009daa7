//! Worker data model — registration, capabilities, and liveness.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Worker ids follow `worker-NNN-kind`: three zero-padded digits, literal
/// `-kind` suffix. Internal workers count from 001, external ones from 100.
static WORKER_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^worker-\d{3}-kind$").expect("worker id regex"));

/// Check a worker id against the required pattern.
pub fn worker_id_is_valid(id: &str) -> bool {
    WORKER_ID_PATTERN.is_match(id)
}

/// Build the id for the n-th internal worker (1-based).
pub fn internal_worker_id(n: usize) -> String {
    format!("worker-{n:03}-kind")
}

/// Worker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// What a worker can run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    /// Concurrent task budget. Internal workers run one at a time.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_tasks: u32,
    /// Substring filters against `problem_id`. Empty means accept anything;
    /// a non-empty list requires at least one substring hit.
    #[serde(default)]
    pub supported_problems: Vec<String>,
}

fn default_max_parallel() -> u32 {
    1
}

impl Default for WorkerCapabilities {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 1,
            supported_problems: Vec::new(),
        }
    }
}

impl WorkerCapabilities {
    /// Substring containment check against a problem id.
    pub fn can_handle(&self, problem_id: &str) -> bool {
        self.supported_problems.is_empty()
            || self
                .supported_problems
                .iter()
                .any(|p| problem_id.contains(p.as_str()))
    }
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub backend_type: String,
    pub status: WorkerStatus,
    pub capabilities: WorkerCapabilities,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<Uuid>,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    /// Liveness check: a fresh heartbeat within `timeout` seconds.
    pub fn is_online(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat).num_seconds()
            <= timeout.as_secs() as i64
    }
}

/// Registration payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub backend_type: String,
    #[serde(default)]
    pub capabilities: WorkerCapabilities,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Heartbeat payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Heartbeat {
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_task_id: Option<Uuid>,
}

/// Per-worker statistics for `GET /workers/{id}/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub success_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
}
