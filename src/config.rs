//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

/// Service settings, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Database location: a file path or `:memory:`.
    pub database_url: String,
    /// Address the HTTP server binds to.
    pub http_addr: String,
    /// Number of in-process workers to run.
    pub num_internal_workers: usize,
    /// Whether internal workers start with the service.
    pub auto_start_workers: bool,
    /// Whether the timeout sweeper runs.
    pub enable_background_tasks: bool,
    /// Default task timeout in minutes (fractional values allowed).
    pub default_timeout_minutes: f64,
    /// Default maximum agent steps per task.
    pub default_max_steps: i64,
    /// Default task priority.
    pub default_priority: i64,
    /// Cadence of the timeout sweeper.
    pub timeout_check_interval: Duration,
    /// Cadence of idle worker polling.
    pub worker_poll_interval: Duration,
    /// Heartbeats older than this mark a worker offline.
    pub worker_heartbeat_timeout: Duration,
    /// External orchestrator command; when set, internal workers run tasks
    /// through it instead of the in-process stub.
    pub orchestrator_cmd: Option<String>,
    /// Credential handed to the orchestrator subprocess. Opaque to the core.
    pub orchestrator_api_key: Option<SecretString>,
    /// Model recorded on tasks when the submitter does not name one.
    pub default_agent_model: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "task-executor.db".to_string(),
            http_addr: "0.0.0.0:8000".to_string(),
            num_internal_workers: 3,
            auto_start_workers: true,
            enable_background_tasks: true,
            default_timeout_minutes: 30.0,
            default_max_steps: 30,
            default_priority: 5,
            timeout_check_interval: Duration::from_secs(60),
            worker_poll_interval: Duration::from_secs(5),
            worker_heartbeat_timeout: Duration::from_secs(60),
            orchestrator_cmd: None,
            orchestrator_api_key: None,
            default_agent_model: "gpt-4".to_string(),
        }
    }
}

impl Settings {
    /// Build Settings from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or(defaults.database_url),
            http_addr: std::env::var("HTTP_ADDR").unwrap_or(defaults.http_addr),
            num_internal_workers: std::env::var("NUM_INTERNAL_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.num_internal_workers),
            auto_start_workers: env_bool("AUTO_START_WORKERS", true),
            enable_background_tasks: env_bool("ENABLE_BACKGROUND_TASKS", true),
            default_timeout_minutes: std::env::var("DEFAULT_TIMEOUT_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_timeout_minutes),
            default_max_steps: std::env::var("DEFAULT_MAX_STEPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_max_steps),
            default_priority: std::env::var("DEFAULT_PRIORITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_priority),
            timeout_check_interval: env_secs(
                "TIMEOUT_CHECK_INTERVAL",
                defaults.timeout_check_interval,
            ),
            worker_poll_interval: env_secs("WORKER_POLL_INTERVAL", defaults.worker_poll_interval),
            worker_heartbeat_timeout: env_secs(
                "WORKER_HEARTBEAT_TIMEOUT",
                defaults.worker_heartbeat_timeout,
            ),
            orchestrator_cmd: std::env::var("ORCHESTRATOR_CMD")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            orchestrator_api_key: std::env::var("ORCHESTRATOR_API_KEY")
                .ok()
                .filter(|v| !v.is_empty())
                .map(SecretString::from),
            default_agent_model: resolve_default_model(),
        }
    }
}

/// Resolve the default LLM model to record with tasks.
fn resolve_default_model() -> String {
    for var in ["OPENROUTER_MODEL", "OPENAI_MODEL", "DEFAULT_AGENT_MODEL"] {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                return value;
            }
        }
    }
    "gpt-4".to_string()
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}
