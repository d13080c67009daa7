//! Task data model — tasks, execution logs, and queue statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Settings;

/// Backend type assigned to tasks that do not name one.
pub const DEFAULT_BACKEND_TYPE: &str = "internal";

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Cancelled)
        )
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// All statuses, for stats aggregation.
    pub fn all() -> [TaskStatus; 6] {
        [
            Self::Pending,
            Self::Running,
            Self::Completed,
            Self::Failed,
            Self::Timeout,
            Self::Cancelled,
        ]
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A task row: one AIOpsLab problem execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique ID.
    pub id: Uuid,
    /// AIOpsLab problem identifier.
    pub problem_id: String,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Execution parameters with defaults merged in; unknown keys are
    /// preserved verbatim.
    pub parameters: serde_json::Value,
    /// Backend pool this task belongs to (derived from parameters).
    pub backend_type: String,
    /// Scheduling priority; higher wins.
    pub priority: i64,
    /// Worker that claimed the task, once claimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Execution result, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error record, set on failure or timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Deadline: `started_at` + the task's timeout budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
}

impl Task {
    /// The task's timeout budget in minutes (fractional values allowed).
    pub fn timeout_minutes(&self) -> f64 {
        self.parameters
            .get("timeout_minutes")
            .and_then(|v| v.as_f64())
            .unwrap_or(30.0)
    }

    /// Maximum agent steps for this task.
    pub fn max_steps(&self) -> i64 {
        self.parameters
            .get("max_steps")
            .and_then(|v| v.as_i64())
            .unwrap_or(30)
    }

    /// Model named in `agent_config`, if any.
    pub fn agent_model(&self) -> Option<&str> {
        self.parameters
            .get("agent_config")
            .and_then(|c| c.get("model"))
            .and_then(|m| m.as_str())
    }
}

/// Request to create a task, before defaults are applied.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub problem_id: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Top-level priority override; falls back to `parameters.priority`.
    #[serde(default)]
    pub priority: Option<i64>,
}

impl NewTask {
    /// Merge service defaults into the submitted parameters.
    ///
    /// User values win over defaults; `agent_config.model` is filled in when
    /// absent or blank. Returns the merged parameters together with the
    /// derived `(backend_type, priority)` pair used for queue ordering.
    pub fn resolve(&self, settings: &Settings) -> (serde_json::Value, String, i64) {
        let mut params = match &self.parameters {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };

        params
            .entry("max_steps")
            .or_insert_with(|| settings.default_max_steps.into());
        params
            .entry("timeout_minutes")
            .or_insert_with(|| settings.default_timeout_minutes.into());
        if let Some(p) = self.priority {
            params.insert("priority".into(), p.into());
        } else {
            params
                .entry("priority")
                .or_insert_with(|| settings.default_priority.into());
        }

        let mut agent_config = match params.get("agent_config") {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        let model_blank = agent_config
            .get("model")
            .and_then(|m| m.as_str())
            .map(|m| m.trim().is_empty())
            .unwrap_or(true);
        if model_blank {
            agent_config.insert(
                "model".into(),
                settings.default_agent_model.clone().into(),
            );
        }
        params.insert("agent_config".into(), agent_config.into());

        let backend_type = params
            .get("backend_type")
            .and_then(|b| b.as_str())
            .unwrap_or(DEFAULT_BACKEND_TYPE)
            .to_string();
        let priority = params
            .get("priority")
            .and_then(|p| p.as_i64())
            .unwrap_or(settings.default_priority);

        (serde_json::Value::Object(params), backend_type, priority)
    }
}

/// One task execution log entry. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub task_id: Uuid,
    /// Per-task monotonic sequence number, gap-free.
    pub seq: i64,
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Filters for task listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub problem_id: Option<String>,
    pub worker_id: Option<String>,
}

/// Pagination window.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
        }
    }
}

impl Page {
    pub fn offset(&self) -> u32 {
        (self.page.max(1) - 1) * self.page_size
    }
}

/// Task counts per status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub timeout: i64,
    pub cancelled: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed + self.timeout + self.cancelled
    }

    /// Completed share of all finished (completed + failed + timeout) tasks.
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.completed + self.failed + self.timeout;
        (finished > 0).then(|| self.completed as f64 / finished as f64)
    }
}

/// Aggregated execution statistics for `GET /tasks/stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub total_tasks: i64,
    pub pending_tasks: i64,
    pub running_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub timeout_tasks: i64,
    pub cancelled_tasks: i64,
    pub avg_execution_time: Option<f64>,
    pub success_rate: Option<f64>,
    pub tasks_by_problem: std::collections::HashMap<String, i64>,
    pub tasks_by_worker: std::collections::HashMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn pending_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn terminal_states_are_frozen() {
        for s in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Timeout,
            TaskStatus::Cancelled,
        ] {
            assert!(s.is_terminal());
            for t in TaskStatus::all() {
                assert!(!s.can_transition_to(t));
            }
        }
    }

    #[test]
    fn resolve_applies_defaults() {
        let new = NewTask {
            problem_id: "misconfig-detection-1".into(),
            parameters: serde_json::json!({}),
            priority: None,
        };
        let (params, backend, priority) = new.resolve(&settings());
        assert_eq!(backend, "internal");
        assert_eq!(priority, 5);
        assert_eq!(params["max_steps"], 30);
        assert_eq!(params["timeout_minutes"], 30.0);
        assert_eq!(params["agent_config"]["model"], "gpt-4");
    }

    #[test]
    fn resolve_keeps_user_values_and_unknown_keys() {
        let new = NewTask {
            problem_id: "p".into(),
            parameters: serde_json::json!({
                "backend_type": "orchestrator",
                "max_steps": 3,
                "agent_config": {"model": "claude-3", "temperature": 0.2},
                "custom_flag": true
            }),
            priority: None,
        };
        let (params, backend, _) = new.resolve(&settings());
        assert_eq!(backend, "orchestrator");
        assert_eq!(params["max_steps"], 3);
        assert_eq!(params["agent_config"]["model"], "claude-3");
        assert_eq!(params["agent_config"]["temperature"], 0.2);
        assert_eq!(params["custom_flag"], true);
    }

    #[test]
    fn top_level_priority_wins() {
        let new = NewTask {
            problem_id: "p".into(),
            parameters: serde_json::json!({"priority": 1}),
            priority: Some(9),
        };
        let (_, _, priority) = new.resolve(&settings());
        assert_eq!(priority, 9);
    }

    #[test]
    fn blank_model_gets_default() {
        let new = NewTask {
            problem_id: "p".into(),
            parameters: serde_json::json!({"agent_config": {"model": "  "}}),
            priority: None,
        };
        let (params, _, _) = new.resolve(&settings());
        assert_eq!(params["agent_config"]["model"], "gpt-4");
    }
}
