//! libSQL backend — async `Store` trait implementation.
//!
//! A single `libsql::Connection` is reused for all operations; it is
//! `Send + Sync` and safe for concurrent async use. At-most-once dispatch is
//! enforced with conditional updates: every state transition re-checks the
//! current status in its `WHERE` clause, so two racing claimants (or a racing
//! cancel and complete) see exactly one winner.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{params, Connection, Database as LibSqlDatabase};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conversations::{
    ConversationFilter, ConversationMessage, ConversationStats, ConversationSummary,
    LlmConversation, MessageRole, NewConversation,
};
use crate::error::StoreError;
use crate::store::migrations;
use crate::store::retry;
use crate::store::traits::Store;
use crate::tasks::{
    LogLevel, Page, QueueStats, Task, TaskFilter, TaskLog, TaskStats, TaskStatus,
};
use crate::workers::model::{
    worker_id_is_valid, Heartbeat, Worker, WorkerCapabilities, WorkerRegistration, WorkerStats,
    WorkerStatus,
};

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Heartbeats older than this make a worker ineligible to claim.
    heartbeat_timeout: Duration,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(
        path: &Path,
        heartbeat_timeout: Duration,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            heartbeat_timeout,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(heartbeat_timeout: Duration) -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            heartbeat_timeout,
        };
        store.init_schema().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn fetch_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn fetch_worker(&self, id: &str) -> Result<Option<Worker>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_worker(&row)?)),
            None => Ok(None),
        }
    }

    /// Release a worker back to idle after its task reached a terminal state.
    async fn release_worker(
        &self,
        worker_id: &str,
        outcome: TaskOutcome,
        now: &str,
    ) -> Result<(), StoreError> {
        let counter = match outcome {
            TaskOutcome::Completed => "tasks_completed = tasks_completed + 1,",
            TaskOutcome::Failed => "tasks_failed = tasks_failed + 1,",
            TaskOutcome::Released => "",
        };
        self.conn()
            .execute(
                &format!(
                    "UPDATE workers SET status = 'idle', current_task_id = NULL, {counter}
                     last_heartbeat = ?1 WHERE id = ?2"
                ),
                params![now, worker_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Terminal-transition helper shared by complete and fail.
    async fn finish_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        outcome: TaskOutcome,
        result: Option<serde_json::Value>,
        error_details: Option<serde_json::Value>,
    ) -> Result<Task, StoreError> {
        let task = self
            .fetch_task(task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;

        if task.worker_id.as_deref() != Some(worker_id) {
            return Err(StoreError::Conflict(format!(
                "Task {task_id} is not owned by worker {worker_id}"
            )));
        }
        let target = match outcome {
            TaskOutcome::Completed => TaskStatus::Completed,
            TaskOutcome::Failed => TaskStatus::Failed,
            TaskOutcome::Released => unreachable!("finish_task always has an outcome status"),
        };
        if !task.status.can_transition_to(target) {
            return Err(StoreError::Conflict(format!(
                "Task {task_id} cannot transition to {target} from {}",
                task.status
            )));
        }

        let now = now_str();
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, result = ?2, error_details = ?3,
                 completed_at = ?4, updated_at = ?4
                 WHERE id = ?5 AND status = 'running'",
                params![
                    target.as_str(),
                    result.as_ref().map(json_text).transpose()?,
                    error_details.as_ref().map(json_text).transpose()?,
                    now.clone(),
                    task_id.to_string()
                ],
            )
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "Task {task_id} left the running state concurrently"
            )));
        }

        self.release_worker(worker_id, outcome, &now).await?;

        self.fetch_task(task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))
    }
}

/// How a finished task affects its worker's counters.
#[derive(Clone, Copy)]
enum TaskOutcome {
    Completed,
    Failed,
    Released,
}

// ── Helper functions ────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, problem_id, status, parameters, backend_type, priority, \
     worker_id, result, error_details, created_at, updated_at, started_at, completed_at, \
     timeout_at";

const WORKER_COLUMNS: &str = "id, backend_type, status, capabilities, metadata, \
     last_heartbeat, current_task_id, tasks_completed, tasks_failed, registered_at";

fn query_err(e: libsql::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

/// Canonical fixed-width timestamp format so string comparison in SQL
/// matches chronological order.
fn now_str() -> String {
    fmt_ts(Utc::now())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn json_text(value: &serde_json::Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or(serde_json::Value::Null)
}

/// Map a libsql row in TASK_COLUMNS order to a Task.
fn row_to_task(row: &libsql::Row) -> Result<Task, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let problem_id: String = row.get(1).map_err(query_err)?;
    let status_str: String = row.get(2).map_err(query_err)?;
    let parameters: String = row.get(3).map_err(query_err)?;
    let backend_type: String = row.get(4).map_err(query_err)?;
    let priority: i64 = row.get(5).map_err(query_err)?;
    let worker_id: Option<String> = row.get::<String>(6).ok();
    let result: Option<String> = row.get::<String>(7).ok();
    let error_details: Option<String> = row.get::<String>(8).ok();
    let created_at: String = row.get(9).map_err(query_err)?;
    let updated_at: String = row.get(10).map_err(query_err)?;
    let started_at: Option<String> = row.get::<String>(11).ok();
    let completed_at: Option<String> = row.get::<String>(12).ok();
    let timeout_at: Option<String> = row.get::<String>(13).ok();

    Ok(Task {
        id: parse_uuid(&id),
        problem_id,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Pending),
        parameters: parse_json(&parameters),
        backend_type,
        priority,
        worker_id,
        result: result.map(|s| parse_json(&s)),
        error_details: error_details.map(|s| parse_json(&s)),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
        started_at: parse_optional_datetime(started_at),
        completed_at: parse_optional_datetime(completed_at),
        timeout_at: parse_optional_datetime(timeout_at),
    })
}

/// Map a libsql row in WORKER_COLUMNS order to a Worker.
fn row_to_worker(row: &libsql::Row) -> Result<Worker, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let backend_type: String = row.get(1).map_err(query_err)?;
    let status_str: String = row.get(2).map_err(query_err)?;
    let capabilities: String = row.get(3).map_err(query_err)?;
    let metadata: String = row.get(4).map_err(query_err)?;
    let last_heartbeat: String = row.get(5).map_err(query_err)?;
    let current_task_id: Option<String> = row.get::<String>(6).ok();
    let tasks_completed: i64 = row.get(7).map_err(query_err)?;
    let tasks_failed: i64 = row.get(8).map_err(query_err)?;
    let registered_at: String = row.get(9).map_err(query_err)?;

    let capabilities: WorkerCapabilities =
        serde_json::from_str(&capabilities).unwrap_or_default();

    Ok(Worker {
        id,
        backend_type,
        status: WorkerStatus::parse(&status_str).unwrap_or(WorkerStatus::Offline),
        capabilities,
        metadata: parse_json(&metadata),
        last_heartbeat: parse_datetime(&last_heartbeat),
        current_task_id: current_task_id.map(|s| parse_uuid(&s)),
        tasks_completed,
        tasks_failed,
        registered_at: parse_datetime(&registered_at),
    })
}

fn row_to_log(row: &libsql::Row) -> Result<TaskLog, StoreError> {
    let task_id: String = row.get(0).map_err(query_err)?;
    let seq: i64 = row.get(1).map_err(query_err)?;
    let level: String = row.get(2).map_err(query_err)?;
    let timestamp: String = row.get(3).map_err(query_err)?;
    let message: String = row.get(4).map_err(query_err)?;
    let context: String = row.get(5).map_err(query_err)?;

    Ok(TaskLog {
        task_id: parse_uuid(&task_id),
        seq,
        level: LogLevel::parse(&level).unwrap_or(LogLevel::Info),
        timestamp: parse_datetime(&timestamp),
        message,
        context: parse_json(&context),
    })
}

const CONVERSATION_COLUMNS: &str = "id, task_id, model, messages, tokens_prompt, \
     tokens_completion, cost_estimate, success, metadata, started_at, ended_at";

fn row_to_conversation(row: &libsql::Row) -> Result<LlmConversation, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let task_id: String = row.get(1).map_err(query_err)?;
    let model: Option<String> = row.get::<String>(2).ok();
    let messages: String = row.get(3).map_err(query_err)?;
    let tokens_prompt: i64 = row.get(4).map_err(query_err)?;
    let tokens_completion: i64 = row.get(5).map_err(query_err)?;
    let cost_estimate: Option<String> = row.get::<String>(6).ok();
    let success: Option<i64> = row.get::<i64>(7).ok();
    let metadata: String = row.get(8).map_err(query_err)?;
    let started_at: String = row.get(9).map_err(query_err)?;
    let ended_at: Option<String> = row.get::<String>(10).ok();

    let messages: Vec<ConversationMessage> =
        serde_json::from_str(&messages).unwrap_or_default();

    Ok(LlmConversation {
        id: parse_uuid(&id),
        task_id: parse_uuid(&task_id),
        model,
        messages,
        tokens_prompt,
        tokens_completion,
        cost_estimate: cost_estimate.and_then(|c| c.parse::<Decimal>().ok()),
        success: success.map(|s| s != 0),
        metadata: parse_json(&metadata),
        started_at: parse_datetime(&started_at),
        ended_at: parse_optional_datetime(ended_at),
    })
}

fn row_to_summary(row: &libsql::Row) -> Result<ConversationSummary, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let task_id: String = row.get(1).map_err(query_err)?;
    let model: Option<String> = row.get::<String>(2).ok();
    let message_count: i64 = row.get(3).map_err(query_err)?;
    let tokens_prompt: i64 = row.get(4).map_err(query_err)?;
    let tokens_completion: i64 = row.get(5).map_err(query_err)?;
    let success: Option<i64> = row.get::<i64>(6).ok();
    let started_at: String = row.get(7).map_err(query_err)?;
    let ended_at: Option<String> = row.get::<String>(8).ok();

    Ok(ConversationSummary {
        id: parse_uuid(&id),
        task_id: parse_uuid(&task_id),
        model,
        message_count,
        tokens_prompt,
        tokens_completion,
        success: success.map(|s| s != 0),
        started_at: parse_datetime(&started_at),
        ended_at: parse_optional_datetime(ended_at),
    })
}

const SUMMARY_COLUMNS: &str = "id, task_id, model, json_array_length(messages), \
     tokens_prompt, tokens_completion, success, started_at, ended_at";

#[async_trait]
impl Store for LibSqlStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(
        &self,
        problem_id: &str,
        parameters: &serde_json::Value,
        backend_type: &str,
        priority: i64,
    ) -> Result<Task, StoreError> {
        let id = Uuid::new_v4();
        let now = now_str();
        let params_text = json_text(parameters)?;

        retry::with_backoff(|| async {
            self.conn()
                .execute(
                    "INSERT INTO tasks (id, problem_id, status, parameters, backend_type,
                     priority, created_at, updated_at)
                     VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?6)",
                    params![
                        id.to_string(),
                        problem_id,
                        params_text.clone(),
                        backend_type,
                        priority,
                        now.clone()
                    ],
                )
                .await
                .map_err(query_err)
        })
        .await?;

        info!(task_id = %id, problem_id, priority, "Task created");

        self.fetch_task(id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        self.fetch_task(id).await
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: Page,
    ) -> Result<(Vec<Task>, i64), StoreError> {
        let mut conditions = Vec::new();
        let mut args: Vec<libsql::Value> = Vec::new();
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string().into());
            conditions.push(format!("status = ?{}", args.len()));
        }
        if let Some(problem_id) = &filter.problem_id {
            args.push(problem_id.clone().into());
            conditions.push(format!("problem_id = ?{}", args.len()));
        }
        if let Some(worker_id) = &filter.worker_id {
            args.push(worker_id.clone().into());
            conditions.push(format!("worker_id = ?{}", args.len()));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let mut count_rows = self
            .conn()
            .query(
                &format!("SELECT COUNT(*) FROM tasks {where_clause}"),
                args.clone(),
            )
            .await
            .map_err(query_err)?;
        let total: i64 = match count_rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err)?,
            None => 0,
        };

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks {where_clause}
                     ORDER BY created_at DESC LIMIT {} OFFSET {}",
                    page.page_size,
                    page.offset()
                ),
                args,
            )
            .await
            .map_err(query_err)?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            tasks.push(row_to_task(&row)?);
        }
        Ok((tasks, total))
    }

    async fn cancel_task(&self, id: Uuid) -> Result<Task, StoreError> {
        let task = self
            .fetch_task(id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", id))?;

        if !task.status.can_transition_to(TaskStatus::Cancelled) {
            return Err(StoreError::Conflict(format!(
                "Task {id} cannot be cancelled from {}",
                task.status
            )));
        }

        let now = now_str();
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'cancelled', completed_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status IN ('pending', 'running')",
                params![now.clone(), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "Task {id} reached a terminal state concurrently"
            )));
        }

        // A running task still has a worker attached; release it. The
        // executor notices the cancelled status at its next poll.
        if task.status == TaskStatus::Running {
            if let Some(worker_id) = &task.worker_id {
                self.release_worker(worker_id, TaskOutcome::Released, &now)
                    .await?;
            }
        }

        self.append_log(id, LogLevel::Info, "Task cancelled", serde_json::json!({}))
            .await?;
        info!(task_id = %id, "Task cancelled");

        self.fetch_task(id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, StoreError> {
        let worker = self
            .fetch_worker(worker_id)
            .await?
            .ok_or_else(|| StoreError::not_found("worker", worker_id))?;

        let now = Utc::now();
        if worker.status == WorkerStatus::Offline
            || worker.status == WorkerStatus::Busy
            || !worker.is_online(now, self.heartbeat_timeout)
        {
            debug!(worker_id, status = worker.status.as_str(), "Worker not eligible to claim");
            return Ok(None);
        }

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status = 'pending' AND backend_type = ?1
                     ORDER BY priority DESC, created_at ASC, rowid ASC"
                ),
                params![worker.backend_type.clone()],
            )
            .await
            .map_err(query_err)?;

        let mut candidates = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let task = row_to_task(&row)?;
            if worker.capabilities.can_handle(&task.problem_id) {
                candidates.push(task);
            }
        }

        for task in candidates {
            let now_text = now_str();
            let timeout_at = fmt_ts(
                Utc::now()
                    + chrono::Duration::milliseconds((task.timeout_minutes() * 60_000.0) as i64),
            );
            // The status guard makes the claim atomic: a concurrent claimant
            // already moved this row and we fall through to the next one.
            let changed = self
                .conn()
                .execute(
                    "UPDATE tasks SET status = 'running', worker_id = ?1, started_at = ?2,
                     timeout_at = ?3, updated_at = ?2
                     WHERE id = ?4 AND status = 'pending'",
                    params![
                        worker_id,
                        now_text.clone(),
                        timeout_at,
                        task.id.to_string()
                    ],
                )
                .await
                .map_err(query_err)?;
            if changed == 0 {
                continue;
            }

            self.conn()
                .execute(
                    "UPDATE workers SET status = 'busy', current_task_id = ?1,
                     last_heartbeat = ?2 WHERE id = ?3",
                    params![task.id.to_string(), now_text, worker_id],
                )
                .await
                .map_err(query_err)?;

            info!(task_id = %task.id, worker_id, problem_id = %task.problem_id, "Task claimed");
            return self.fetch_task(task.id).await;
        }

        Ok(None)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Task, StoreError> {
        let task = self
            .finish_task(task_id, worker_id, TaskOutcome::Completed, Some(result), None)
            .await?;
        self.append_log(
            task_id,
            LogLevel::Info,
            "Task completed successfully",
            serde_json::json!({"worker_id": worker_id}),
        )
        .await?;
        info!(task_id = %task_id, worker_id, "Task completed");
        Ok(task)
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error_details: serde_json::Value,
    ) -> Result<Task, StoreError> {
        let task = self
            .finish_task(
                task_id,
                worker_id,
                TaskOutcome::Failed,
                None,
                Some(error_details.clone()),
            )
            .await?;
        self.append_log(
            task_id,
            LogLevel::Error,
            "Task failed",
            serde_json::json!({"worker_id": worker_id, "error": error_details}),
        )
        .await?;
        warn!(task_id = %task_id, worker_id, "Task failed");
        Ok(task)
    }

    async fn expire_running(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = fmt_ts(now);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status = 'running' AND timeout_at IS NOT NULL AND timeout_at <= ?1"
                ),
                params![cutoff],
            )
            .await
            .map_err(query_err)?;

        let mut expired_tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            expired_tasks.push(row_to_task(&row)?);
        }

        let mut expired = Vec::new();
        for task in expired_tasks {
            let timeout_minutes = task.timeout_minutes();
            let error = serde_json::json!({
                "error": format!("Task exceeded timeout limit of {timeout_minutes} minutes"),
                "timeout_minutes": timeout_minutes,
            });
            let now_text = now_str();
            let changed = self
                .conn()
                .execute(
                    "UPDATE tasks SET status = 'timeout', error_details = ?1,
                     completed_at = ?2, updated_at = ?2
                     WHERE id = ?3 AND status = 'running'",
                    params![json_text(&error)?, now_text.clone(), task.id.to_string()],
                )
                .await
                .map_err(query_err)?;
            if changed == 0 {
                continue;
            }

            if let Some(worker_id) = &task.worker_id {
                self.release_worker(worker_id, TaskOutcome::Released, &now_text)
                    .await?;
            }
            self.append_log(
                task.id,
                LogLevel::Error,
                &format!("Task timed out after {timeout_minutes} minutes"),
                serde_json::json!({"timeout_minutes": timeout_minutes}),
            )
            .await?;
            warn!(task_id = %task.id, timeout_minutes, "Task timed out");
            expired.push(task.id);
        }

        Ok(expired)
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM tasks GROUP BY status", ())
            .await
            .map_err(query_err)?;

        let mut stats = QueueStats::default();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let status: String = row.get(0).map_err(query_err)?;
            let count: i64 = row.get(1).map_err(query_err)?;
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Pending) => stats.pending = count,
                Some(TaskStatus::Running) => stats.running = count,
                Some(TaskStatus::Completed) => stats.completed = count,
                Some(TaskStatus::Failed) => stats.failed = count,
                Some(TaskStatus::Timeout) => stats.timeout = count,
                Some(TaskStatus::Cancelled) => stats.cancelled = count,
                None => {}
            }
        }
        Ok(stats)
    }

    async fn task_stats(&self) -> Result<TaskStats, StoreError> {
        let queue = self.queue_stats().await?;

        let mut avg_rows = self
            .conn()
            .query(
                "SELECT AVG((julianday(completed_at) - julianday(started_at)) * 86400.0)
                 FROM tasks WHERE status = 'completed'
                 AND started_at IS NOT NULL AND completed_at IS NOT NULL",
                (),
            )
            .await
            .map_err(query_err)?;
        let avg_execution_time: Option<f64> = match avg_rows.next().await.map_err(query_err)? {
            Some(row) => row.get::<f64>(0).ok(),
            None => None,
        };

        let mut by_problem = std::collections::HashMap::new();
        let mut rows = self
            .conn()
            .query(
                "SELECT problem_id, COUNT(*) FROM tasks GROUP BY problem_id",
                (),
            )
            .await
            .map_err(query_err)?;
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let problem: String = row.get(0).map_err(query_err)?;
            let count: i64 = row.get(1).map_err(query_err)?;
            by_problem.insert(problem, count);
        }

        let mut by_worker = std::collections::HashMap::new();
        let mut rows = self
            .conn()
            .query(
                "SELECT worker_id, COUNT(*) FROM tasks
                 WHERE worker_id IS NOT NULL GROUP BY worker_id",
                (),
            )
            .await
            .map_err(query_err)?;
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let worker: String = row.get(0).map_err(query_err)?;
            let count: i64 = row.get(1).map_err(query_err)?;
            by_worker.insert(worker, count);
        }

        Ok(TaskStats {
            total_tasks: queue.total(),
            pending_tasks: queue.pending,
            running_tasks: queue.running,
            completed_tasks: queue.completed,
            failed_tasks: queue.failed,
            timeout_tasks: queue.timeout,
            cancelled_tasks: queue.cancelled,
            avg_execution_time,
            success_rate: queue.success_rate(),
            tasks_by_problem: by_problem,
            tasks_by_worker: by_worker,
        })
    }

    // ── Task logs ───────────────────────────────────────────────────

    async fn append_log(
        &self,
        task_id: Uuid,
        level: LogLevel,
        message: &str,
        context: serde_json::Value,
    ) -> Result<TaskLog, StoreError> {
        if self.fetch_task(task_id).await?.is_none() {
            return Err(StoreError::not_found("task", task_id));
        }

        let now = now_str();
        // Single-statement insert keeps seq gap-free under concurrency.
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO task_logs (task_id, seq, level, timestamp, message, context)
                 SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3, ?4, ?5
                 FROM task_logs WHERE task_id = ?1
                 RETURNING seq",
                params![
                    task_id.to_string(),
                    level.as_str(),
                    now.clone(),
                    message,
                    json_text(&context)?
                ],
            )
            .await
            .map_err(query_err)?;
        let seq: i64 = match rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err)?,
            None => return Err(StoreError::Query("log insert returned no row".into())),
        };

        Ok(TaskLog {
            task_id,
            seq,
            level,
            timestamp: parse_datetime(&now),
            message: message.to_string(),
            context,
        })
    }

    async fn get_logs(
        &self,
        task_id: Uuid,
        level: Option<LogLevel>,
        limit: u32,
    ) -> Result<Vec<TaskLog>, StoreError> {
        let sql = match level {
            Some(_) => {
                "SELECT task_id, seq, level, timestamp, message, context FROM task_logs
                 WHERE task_id = ?1 AND level = ?2 ORDER BY seq ASC LIMIT ?3"
            }
            None => {
                "SELECT task_id, seq, level, timestamp, message, context FROM task_logs
                 WHERE task_id = ?1 ORDER BY seq ASC LIMIT ?2"
            }
        };
        let mut rows = match level {
            Some(level) => self
                .conn()
                .query(
                    sql,
                    params![task_id.to_string(), level.as_str(), limit as i64],
                )
                .await
                .map_err(query_err)?,
            None => self
                .conn()
                .query(sql, params![task_id.to_string(), limit as i64])
                .await
                .map_err(query_err)?,
        };

        let mut logs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            logs.push(row_to_log(&row)?);
        }
        Ok(logs)
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn upsert_worker(&self, reg: &WorkerRegistration) -> Result<Worker, StoreError> {
        if !worker_id_is_valid(&reg.worker_id) {
            return Err(StoreError::Conflict(format!(
                "Worker id '{}' does not match pattern worker-NNN-kind",
                reg.worker_id
            )));
        }

        let now = now_str();
        let capabilities = serde_json::to_string(&reg.capabilities)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let metadata = json_text(&reg.metadata)?;

        self.conn()
            .execute(
                "INSERT INTO workers (id, backend_type, status, capabilities, metadata,
                 last_heartbeat, registered_at)
                 VALUES (?1, ?2, 'idle', ?3, ?4, ?5, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    backend_type = excluded.backend_type,
                    capabilities = excluded.capabilities,
                    metadata = excluded.metadata,
                    status = 'idle',
                    current_task_id = NULL,
                    last_heartbeat = excluded.last_heartbeat",
                params![
                    reg.worker_id.clone(),
                    reg.backend_type.clone(),
                    capabilities,
                    metadata,
                    now
                ],
            )
            .await
            .map_err(query_err)?;

        info!(worker_id = %reg.worker_id, backend_type = %reg.backend_type, "Worker registered");

        self.fetch_worker(&reg.worker_id)
            .await?
            .ok_or_else(|| StoreError::not_found("worker", &reg.worker_id))
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, StoreError> {
        self.fetch_worker(id).await
    }

    async fn list_workers(
        &self,
        status: Option<WorkerStatus>,
        backend_type: Option<&str>,
    ) -> Result<Vec<Worker>, StoreError> {
        let mut conditions = Vec::new();
        let mut args: Vec<libsql::Value> = Vec::new();
        if let Some(status) = status {
            args.push(status.as_str().to_string().into());
            conditions.push(format!("status = ?{}", args.len()));
        }
        if let Some(backend) = backend_type {
            args.push(backend.to_string().into());
            conditions.push(format!("backend_type = ?{}", args.len()));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers {where_clause} ORDER BY id"),
                args,
            )
            .await
            .map_err(query_err)?;

        let mut workers = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            workers.push(row_to_worker(&row)?);
        }
        Ok(workers)
    }

    async fn heartbeat(&self, worker_id: &str, beat: &Heartbeat) -> Result<Worker, StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE workers SET last_heartbeat = ?1, status = ?2, current_task_id = ?3
                 WHERE id = ?4",
                params![
                    now_str(),
                    beat.status.as_str(),
                    beat.current_task_id.map(|t| t.to_string()),
                    worker_id
                ],
            )
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Err(StoreError::not_found("worker", worker_id));
        }

        debug!(worker_id, status = beat.status.as_str(), "Worker heartbeat");

        self.fetch_worker(worker_id)
            .await?
            .ok_or_else(|| StoreError::not_found("worker", worker_id))
    }

    async fn mark_stale_workers_offline(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let cutoff = fmt_ts(now - chrono::Duration::seconds(timeout.as_secs() as i64));

        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM workers WHERE status != 'offline' AND last_heartbeat < ?1",
                params![cutoff.clone()],
            )
            .await
            .map_err(query_err)?;
        let mut stale = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let id: String = row.get(0).map_err(query_err)?;
            stale.push(id);
        }

        if !stale.is_empty() {
            self.conn()
                .execute(
                    "UPDATE workers SET status = 'offline', current_task_id = NULL
                     WHERE status != 'offline' AND last_heartbeat < ?1",
                    params![cutoff],
                )
                .await
                .map_err(query_err)?;
            for id in &stale {
                warn!(worker_id = %id, "Worker marked offline after missed heartbeats");
            }
        }

        Ok(stale)
    }

    async fn worker_stats(&self, id: &str) -> Result<WorkerStats, StoreError> {
        let worker = self
            .fetch_worker(id)
            .await?
            .ok_or_else(|| StoreError::not_found("worker", id))?;

        let finished = worker.tasks_completed + worker.tasks_failed;
        Ok(WorkerStats {
            worker_id: worker.id,
            status: worker.status,
            tasks_completed: worker.tasks_completed,
            tasks_failed: worker.tasks_failed,
            success_rate: (finished > 0)
                .then(|| worker.tasks_completed as f64 / finished as f64),
            current_task_id: worker.current_task_id,
            last_heartbeat: worker.last_heartbeat,
        })
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn insert_conversation(
        &self,
        new: &NewConversation,
    ) -> Result<LlmConversation, StoreError> {
        if self.fetch_task(new.task_id).await?.is_none() {
            return Err(StoreError::not_found("task", new.task_id));
        }

        let id = Uuid::new_v4();
        let now = now_str();
        self.conn()
            .execute(
                "INSERT INTO llm_conversations (id, task_id, model, metadata, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    new.task_id.to_string(),
                    new.model.clone(),
                    json_text(&new.metadata)?,
                    now
                ],
            )
            .await
            .map_err(query_err)?;

        debug!(conversation_id = %id, task_id = %new.task_id, "Conversation opened");

        self.get_conversation(id)
            .await?
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }

    async fn append_conversation_message(
        &self,
        conversation_id: Uuid,
        message: &ConversationMessage,
    ) -> Result<(), StoreError> {
        let message_text = serde_json::to_string(message)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        // json_insert with '$[#]' appends in a single statement, keeping
        // message order total per conversation.
        let changed = self
            .conn()
            .execute(
                "UPDATE llm_conversations
                 SET messages = json_insert(messages, '$[#]', json(?1))
                 WHERE id = ?2",
                params![message_text, conversation_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Err(StoreError::not_found("conversation", conversation_id));
        }
        Ok(())
    }

    async fn finalize_conversation(
        &self,
        conversation_id: Uuid,
        tokens_prompt: i64,
        tokens_completion: i64,
        cost_estimate: Option<Decimal>,
        success: bool,
    ) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE llm_conversations SET tokens_prompt = ?1, tokens_completion = ?2,
                 cost_estimate = ?3, success = ?4, ended_at = ?5
                 WHERE id = ?6",
                params![
                    tokens_prompt,
                    tokens_completion,
                    cost_estimate.map(|c| c.to_string()),
                    success as i64,
                    now_str(),
                    conversation_id.to_string()
                ],
            )
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Err(StoreError::not_found("conversation", conversation_id));
        }
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<LlmConversation>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM llm_conversations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_conversation(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
        page: Page,
    ) -> Result<(Vec<ConversationSummary>, i64), StoreError> {
        let mut conditions = Vec::new();
        let mut args: Vec<libsql::Value> = Vec::new();
        if let Some(task_id) = filter.task_id {
            args.push(task_id.to_string().into());
            conditions.push(format!("task_id = ?{}", args.len()));
        }
        if let Some(model) = &filter.model {
            args.push(model.clone().into());
            conditions.push(format!("model = ?{}", args.len()));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let mut count_rows = self
            .conn()
            .query(
                &format!("SELECT COUNT(*) FROM llm_conversations {where_clause}"),
                args.clone(),
            )
            .await
            .map_err(query_err)?;
        let total: i64 = match count_rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err)?,
            None => 0,
        };

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUMMARY_COLUMNS} FROM llm_conversations {where_clause}
                     ORDER BY started_at DESC LIMIT {} OFFSET {}",
                    page.page_size,
                    page.offset()
                ),
                args,
            )
            .await
            .map_err(query_err)?;

        let mut summaries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            summaries.push(row_to_summary(&row)?);
        }
        Ok((summaries, total))
    }

    async fn conversations_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        if self.fetch_task(task_id).await?.is_none() {
            return Err(StoreError::not_found("task", task_id));
        }

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUMMARY_COLUMNS} FROM llm_conversations
                     WHERE task_id = ?1 ORDER BY started_at ASC"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut summaries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            summaries.push(row_to_summary(&row)?);
        }
        Ok(summaries)
    }

    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
        role: Option<MessageRole>,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        let conversation = self
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| StoreError::not_found("conversation", conversation_id))?;

        let messages = match role {
            Some(role) => conversation
                .messages
                .into_iter()
                .filter(|m| m.role == role)
                .collect(),
            None => conversation.messages,
        };
        Ok(messages)
    }

    async fn conversation_stats(&self) -> Result<ConversationStats, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT model, json_array_length(messages), tokens_prompt,
                 tokens_completion, cost_estimate FROM llm_conversations",
                (),
            )
            .await
            .map_err(query_err)?;

        let mut stats = ConversationStats::default();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let model: Option<String> = row.get::<String>(0).ok();
            let message_count: i64 = row.get(1).map_err(query_err)?;
            let tokens_prompt: i64 = row.get(2).map_err(query_err)?;
            let tokens_completion: i64 = row.get(3).map_err(query_err)?;
            let cost: Option<String> = row.get::<String>(4).ok();

            stats.total_conversations += 1;
            stats.total_messages += message_count;
            stats.total_tokens_prompt += tokens_prompt;
            stats.total_tokens_completion += tokens_completion;
            if let Some(cost) = cost.and_then(|c| c.parse::<Decimal>().ok()) {
                stats.total_cost_estimate += cost;
            }
            if let Some(model) = model {
                *stats.conversations_by_model.entry(model).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT 1", ())
            .await
            .map_err(query_err)?;
        rows.next().await.map_err(query_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::tasks::NewTask;

    async fn test_store() -> LibSqlStore {
        LibSqlStore::new_memory(Duration::from_secs(60))
            .await
            .unwrap()
    }

    fn registration(id: &str, backend: &str) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: id.to_string(),
            backend_type: backend.to_string(),
            capabilities: WorkerCapabilities::default(),
            metadata: serde_json::json!({"host": "test"}),
        }
    }

    async fn submit(store: &LibSqlStore, problem: &str, params: serde_json::Value) -> Task {
        let new = NewTask {
            problem_id: problem.to_string(),
            parameters: params,
            priority: None,
        };
        let (params, backend, priority) = new.resolve(&Settings::default());
        store
            .insert_task(problem, &params, &backend, priority)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let store = test_store().await;
        let task = submit(&store, "misconfig-1", serde_json::json!({})).await;

        let fetched = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.problem_id, "misconfig-1");
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert_eq!(fetched.backend_type, "internal");
        assert_eq!(fetched.priority, 5);
        assert_eq!(fetched.parameters["agent_config"]["model"], "gpt-4");
        assert!(fetched.worker_id.is_none());
        assert!(fetched.started_at.is_none());
    }

    #[tokio::test]
    async fn claim_follows_priority_then_fifo() {
        let store = test_store().await;
        let low = submit(&store, "p-low", serde_json::json!({"priority": 1})).await;
        let high = submit(&store, "p-high", serde_json::json!({"priority": 5})).await;
        let mid = submit(&store, "p-mid", serde_json::json!({"priority": 3})).await;
        store
            .upsert_worker(&registration("worker-001-kind", "internal"))
            .await
            .unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            let task = store.claim_next("worker-001-kind").await.unwrap().unwrap();
            order.push(task.id);
            store
                .complete_task(task.id, "worker-001-kind", serde_json::json!({"score": 1}))
                .await
                .unwrap();
        }

        assert_eq!(order, vec![high.id, mid.id, low.id]);
    }

    #[tokio::test]
    async fn claim_respects_backend_affinity() {
        let store = test_store().await;
        submit(
            &store,
            "orch-problem",
            serde_json::json!({"backend_type": "orchestrator"}),
        )
        .await;
        store
            .upsert_worker(&registration("worker-001-kind", "internal"))
            .await
            .unwrap();

        assert!(store.claim_next("worker-001-kind").await.unwrap().is_none());

        store
            .upsert_worker(&registration("worker-100-kind", "orchestrator"))
            .await
            .unwrap();
        let claimed = store.claim_next("worker-100-kind").await.unwrap().unwrap();
        assert_eq!(claimed.problem_id, "orch-problem");
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-100-kind"));
    }

    #[tokio::test]
    async fn claim_applies_capability_substrings() {
        let store = test_store().await;
        submit(&store, "analysis-1", serde_json::json!({"priority": 9})).await;
        submit(&store, "detection-1", serde_json::json!({"priority": 1})).await;

        let mut reg = registration("worker-001-kind", "internal");
        reg.capabilities.supported_problems = vec!["detection".into()];
        store.upsert_worker(&reg).await.unwrap();

        // The higher-priority task is skipped; it fails the substring filter.
        let claimed = store.claim_next("worker-001-kind").await.unwrap().unwrap();
        assert_eq!(claimed.problem_id, "detection-1");
    }

    #[tokio::test]
    async fn second_claimant_gets_nothing() {
        let store = test_store().await;
        submit(&store, "only-one", serde_json::json!({})).await;
        store
            .upsert_worker(&registration("worker-001-kind", "internal"))
            .await
            .unwrap();
        store
            .upsert_worker(&registration("worker-002-kind", "internal"))
            .await
            .unwrap();

        let first = store.claim_next("worker-001-kind").await.unwrap();
        let second = store.claim_next("worker-002-kind").await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn busy_worker_claims_nothing() {
        let store = test_store().await;
        submit(&store, "a", serde_json::json!({})).await;
        submit(&store, "b", serde_json::json!({})).await;
        store
            .upsert_worker(&registration("worker-001-kind", "internal"))
            .await
            .unwrap();

        assert!(store.claim_next("worker-001-kind").await.unwrap().is_some());
        // Worker is now busy with max_parallel_tasks = 1.
        assert!(store.claim_next("worker-001-kind").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_requires_ownership() {
        let store = test_store().await;
        submit(&store, "p", serde_json::json!({})).await;
        store
            .upsert_worker(&registration("worker-001-kind", "internal"))
            .await
            .unwrap();
        store
            .upsert_worker(&registration("worker-002-kind", "internal"))
            .await
            .unwrap();

        let task = store.claim_next("worker-001-kind").await.unwrap().unwrap();
        let err = store
            .complete_task(task.id, "worker-002-kind", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn complete_updates_worker_counters() {
        let store = test_store().await;
        submit(&store, "p", serde_json::json!({})).await;
        store
            .upsert_worker(&registration("worker-001-kind", "internal"))
            .await
            .unwrap();

        let task = store.claim_next("worker-001-kind").await.unwrap().unwrap();
        let done = store
            .complete_task(task.id, "worker-001-kind", serde_json::json!({"score": 1}))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());

        let worker = store.get_worker("worker-001-kind").await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(worker.tasks_completed, 1);
        assert!(worker.current_task_id.is_none());
    }

    #[tokio::test]
    async fn terminal_tasks_are_immutable() {
        let store = test_store().await;
        submit(&store, "p", serde_json::json!({})).await;
        store
            .upsert_worker(&registration("worker-001-kind", "internal"))
            .await
            .unwrap();

        let task = store.claim_next("worker-001-kind").await.unwrap().unwrap();
        store
            .complete_task(task.id, "worker-001-kind", serde_json::json!({}))
            .await
            .unwrap();

        assert!(matches!(
            store
                .complete_task(task.id, "worker-001-kind", serde_json::json!({}))
                .await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.cancel_task(task.id).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn cancel_pending_and_running() {
        let store = test_store().await;
        let pending = submit(&store, "p1", serde_json::json!({})).await;
        let cancelled = store.cancel_task(pending.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        submit(&store, "p2", serde_json::json!({})).await;
        store
            .upsert_worker(&registration("worker-001-kind", "internal"))
            .await
            .unwrap();
        let running = store.claim_next("worker-001-kind").await.unwrap().unwrap();
        let cancelled = store.cancel_task(running.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let worker = store.get_worker("worker-001-kind").await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn expire_running_flips_to_timeout() {
        let store = test_store().await;
        submit(&store, "slow", serde_json::json!({"timeout_minutes": 0.0001})).await;
        store
            .upsert_worker(&registration("worker-001-kind", "internal"))
            .await
            .unwrap();
        let task = store.claim_next("worker-001-kind").await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let expired = store.expire_running(Utc::now()).await.unwrap();
        assert_eq!(expired, vec![task.id]);

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);
        assert!(task.error_details.is_some());

        let logs = store
            .get_logs(task.id, Some(LogLevel::Error), 10)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);

        let worker = store.get_worker("worker-001-kind").await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);

        // Idempotent: a second sweep finds nothing.
        assert!(store.expire_running(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_seq_is_gap_free() {
        let store = test_store().await;
        let task = submit(&store, "p", serde_json::json!({})).await;

        for i in 0..5 {
            store
                .append_log(
                    task.id,
                    LogLevel::Info,
                    &format!("step {i}"),
                    serde_json::json!({}),
                )
                .await
                .unwrap();
        }

        let logs = store.get_logs(task.id, None, 100).await.unwrap();
        let seqs: Vec<i64> = logs.iter().map(|l| l.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn stale_workers_go_offline() {
        let store = test_store().await;
        store
            .upsert_worker(&registration("worker-001-kind", "internal"))
            .await
            .unwrap();

        // Nothing stale within the window.
        let stale = store
            .mark_stale_workers_offline(Utc::now(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(stale.is_empty());

        // Pretend the heartbeat lapsed by sweeping far in the future.
        let future = Utc::now() + chrono::Duration::seconds(120);
        let stale = store
            .mark_stale_workers_offline(future, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(stale, vec!["worker-001-kind".to_string()]);

        let worker = store.get_worker("worker-001-kind").await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Offline);
        assert!(store.claim_next("worker-001-kind").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_worker_id_rejected() {
        let store = test_store().await;
        let err = store
            .upsert_worker(&registration("worker-1-kind", "internal"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn conversation_round_trip() {
        let store = test_store().await;
        let task = submit(&store, "p", serde_json::json!({})).await;

        let conv = store
            .insert_conversation(&NewConversation {
                task_id: task.id,
                model: Some("gpt-4".into()),
                metadata: serde_json::json!({
                    "problem_id": "p",
                    "worker_id": "worker-001-kind",
                    "cluster_id": "aiopslab-worker-001-kind"
                }),
            })
            .await
            .unwrap();

        store
            .append_conversation_message(
                conv.id,
                &ConversationMessage::new(MessageRole::User, "observation"),
            )
            .await
            .unwrap();
        store
            .append_conversation_message(
                conv.id,
                &ConversationMessage::new(MessageRole::Assistant, "action"),
            )
            .await
            .unwrap();
        store
            .finalize_conversation(conv.id, 100, 20, Some(Decimal::new(15, 4)), true)
            .await
            .unwrap();

        let loaded = store.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].role, MessageRole::User);
        assert_eq!(loaded.tokens_prompt, 100);
        assert_eq!(loaded.success, Some(true));
        assert!(loaded.ended_at.is_some());

        let assistant_only = store
            .conversation_messages(conv.id, Some(MessageRole::Assistant))
            .await
            .unwrap();
        assert_eq!(assistant_only.len(), 1);

        let summaries = store.conversations_for_task(task.id).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].message_count, 2);

        let stats = store.conversation_stats().await.unwrap();
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.conversations_by_model["gpt-4"], 1);
    }

    #[tokio::test]
    async fn list_tasks_filters_and_counts() {
        let store = test_store().await;
        submit(&store, "alpha", serde_json::json!({})).await;
        submit(&store, "alpha", serde_json::json!({})).await;
        submit(&store, "beta", serde_json::json!({})).await;

        let (tasks, total) = store
            .list_tasks(
                &TaskFilter {
                    problem_id: Some("alpha".into()),
                    ..Default::default()
                },
                Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(tasks.len(), 2);

        let (tasks, total) = store
            .list_tasks(
                &TaskFilter {
                    status: Some(TaskStatus::Pending),
                    ..Default::default()
                },
                Page {
                    page: 1,
                    page_size: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(tasks.len(), 2);
    }

    #[tokio::test]
    async fn queue_stats_counts_by_status() {
        let store = test_store().await;
        submit(&store, "a", serde_json::json!({})).await;
        submit(&store, "b", serde_json::json!({})).await;
        store
            .upsert_worker(&registration("worker-001-kind", "internal"))
            .await
            .unwrap();
        let task = store.claim_next("worker-001-kind").await.unwrap().unwrap();
        store
            .complete_task(task.id, "worker-001-kind", serde_json::json!({}))
            .await
            .unwrap();

        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.success_rate(), Some(1.0));
    }
}
