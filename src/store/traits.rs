//! Unified `Store` trait — single async interface for all persistence.
//!
//! Every state transition in the service flows through this trait; the
//! in-process worker manager, the sweeper, and the HTTP handlers all share
//! one implementation behind an `Arc<dyn Store>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::conversations::{
    ConversationFilter, ConversationMessage, ConversationStats, ConversationSummary,
    LlmConversation, MessageRole, NewConversation,
};
use crate::error::StoreError;
use crate::tasks::{LogLevel, Page, QueueStats, Task, TaskFilter, TaskLog, TaskStats};
use crate::workers::model::{Heartbeat, Worker, WorkerRegistration, WorkerStats, WorkerStatus};

/// Backend-agnostic store covering tasks, logs, workers, and conversations.
#[async_trait]
pub trait Store: Send + Sync {
    /// Initialize the schema (idempotent).
    async fn init_schema(&self) -> Result<(), StoreError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a pending task with already-resolved parameters.
    async fn insert_task(
        &self,
        problem_id: &str,
        parameters: &serde_json::Value,
        backend_type: &str,
        priority: i64,
    ) -> Result<Task, StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// List tasks newest-first. Returns the page and the total match count.
    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: Page,
    ) -> Result<(Vec<Task>, i64), StoreError>;

    /// Cancel a pending or running task. Terminal states yield `Conflict`.
    async fn cancel_task(&self, id: Uuid) -> Result<Task, StoreError>;

    /// Atomically claim the next eligible pending task for a worker.
    ///
    /// Applies backend affinity, priority ordering (FIFO within a priority),
    /// and the worker's `supported_problems` substring filter. Returns `None`
    /// when nothing is claimable or the worker is not currently eligible.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, StoreError>;

    /// Mark a running task completed. Verifies the caller owns the task.
    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Task, StoreError>;

    /// Mark a running task failed. Verifies the caller owns the task.
    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error_details: serde_json::Value,
    ) -> Result<Task, StoreError>;

    /// Flip running tasks past their deadline to `timeout`, releasing their
    /// workers. Returns the expired task ids. Idempotent.
    async fn expire_running(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    async fn queue_stats(&self) -> Result<QueueStats, StoreError>;

    async fn task_stats(&self) -> Result<TaskStats, StoreError>;

    // ── Task logs ───────────────────────────────────────────────────

    /// Append a log entry, assigning the next per-task sequence number.
    async fn append_log(
        &self,
        task_id: Uuid,
        level: LogLevel,
        message: &str,
        context: serde_json::Value,
    ) -> Result<TaskLog, StoreError>;

    /// Logs for a task in sequence order, optionally filtered by level.
    async fn get_logs(
        &self,
        task_id: Uuid,
        level: Option<LogLevel>,
        limit: u32,
    ) -> Result<Vec<TaskLog>, StoreError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Register a worker or refresh an existing registration. Re-registration
    /// resets the worker to idle with a fresh heartbeat.
    async fn upsert_worker(&self, reg: &WorkerRegistration) -> Result<Worker, StoreError>;

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, StoreError>;

    async fn list_workers(
        &self,
        status: Option<WorkerStatus>,
        backend_type: Option<&str>,
    ) -> Result<Vec<Worker>, StoreError>;

    /// Refresh a worker's heartbeat and reported state.
    async fn heartbeat(&self, worker_id: &str, beat: &Heartbeat) -> Result<Worker, StoreError>;

    /// Mark workers whose heartbeat lapsed as offline, clearing their task
    /// pointer without touching the task rows. Returns the affected ids.
    async fn mark_stale_workers_offline(
        &self,
        now: DateTime<Utc>,
        timeout: std::time::Duration,
    ) -> Result<Vec<String>, StoreError>;

    async fn worker_stats(&self, id: &str) -> Result<WorkerStats, StoreError>;

    // ── Conversations ───────────────────────────────────────────────

    async fn insert_conversation(
        &self,
        new: &NewConversation,
    ) -> Result<LlmConversation, StoreError>;

    async fn append_conversation_message(
        &self,
        conversation_id: Uuid,
        message: &ConversationMessage,
    ) -> Result<(), StoreError>;

    /// Close a conversation with final token counts, cost, and outcome.
    async fn finalize_conversation(
        &self,
        conversation_id: Uuid,
        tokens_prompt: i64,
        tokens_completion: i64,
        cost_estimate: Option<Decimal>,
        success: bool,
    ) -> Result<(), StoreError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<LlmConversation>, StoreError>;

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
        page: Page,
    ) -> Result<(Vec<ConversationSummary>, i64), StoreError>;

    async fn conversations_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<ConversationSummary>, StoreError>;

    /// Messages of one conversation, optionally filtered by role.
    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
        role: Option<MessageRole>,
    ) -> Result<Vec<ConversationMessage>, StoreError>;

    async fn conversation_stats(&self) -> Result<ConversationStats, StoreError>;

    // ── Health ──────────────────────────────────────────────────────

    /// Cheap connectivity probe for `/health`.
    async fn ping(&self) -> Result<(), StoreError>;
}
