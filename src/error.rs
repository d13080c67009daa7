//! Error types for the task executor.

use uuid::Uuid;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence-layer errors.
///
/// `Conflict` covers every state-machine violation: completing a task that is
/// not running, cancelling a terminal task, a worker id that fails the
/// pattern check, or a worker touching a task it does not own.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transient failure (database busy/locked) that survived local retries.
    #[error("Store temporarily unavailable: {0}")]
    Transient(String),
}

impl StoreError {
    /// Not-found constructor used throughout the backend.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Errors produced while executing a claimed task.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Task {task_id} execution failed: {reason}")]
    Failed { task_id: Uuid, reason: String },

    #[error("Task {task_id} was cancelled during execution")]
    Cancelled { task_id: Uuid },

    #[error("Orchestrator process error: {0}")]
    Process(String),

    #[error("Orchestrator produced unparseable output: {0}")]
    BadOutput(String),

    #[error("Store error during execution: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
