//! Executor adapters — run a claimed task end-to-end.
//!
//! Executors stream logs and conversation transcripts into the store while
//! they work, and poll the task's status between steps so a cancel (or a
//! sweeper-enforced timeout) stops the run cooperatively. They never touch
//! the task's terminal state themselves; the worker loop owns complete/fail.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conversations::{ConversationMessage, MessageRole, NewConversation};
use crate::error::ExecutionError;
use crate::store::Store;
use crate::tasks::{LogLevel, Task, TaskStatus};

/// Runs one claimed task to a result map or an execution error.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        task: &Task,
        worker_id: &str,
    ) -> Result<serde_json::Value, ExecutionError>;
}

/// Clusters are assigned 1:1 to workers.
fn cluster_for(worker_id: &str) -> String {
    format!("aiopslab-{worker_id}")
}

/// Conversation metadata shared by both executors.
fn conversation_metadata(task: &Task, worker_id: &str) -> serde_json::Value {
    serde_json::json!({
        "problem_id": task.problem_id,
        "worker_id": worker_id,
        "cluster_id": cluster_for(worker_id),
    })
}

/// True once the task has left the running state (cancelled, timed out, or
/// otherwise finished behind our back) and work should stop.
async fn should_abort(store: &Arc<dyn Store>, task_id: Uuid) -> bool {
    match store.get_task(task_id).await {
        Ok(Some(task)) => task.status != TaskStatus::Running,
        Ok(None) => true,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Cancellation poll failed");
            false
        }
    }
}

// ── Stub executor ───────────────────────────────────────────────────

/// Deterministic in-process executor used when no orchestrator command is
/// configured. Walks `max_steps` simulated agent steps, logging each one and
/// recording an observation/action transcript.
pub struct StubExecutor {
    store: Arc<dyn Store>,
    step_delay: Duration,
}

impl StubExecutor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            step_delay: Duration::from_millis(100),
        }
    }

    /// Override the per-step delay (tests use a near-zero value).
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

#[async_trait]
impl Executor for StubExecutor {
    async fn execute(
        &self,
        task: &Task,
        worker_id: &str,
    ) -> Result<serde_json::Value, ExecutionError> {
        let max_steps = task.max_steps();
        info!(task_id = %task.id, problem_id = %task.problem_id, max_steps, "Execution started");

        let conversation = self
            .store
            .insert_conversation(&NewConversation {
                task_id: task.id,
                model: task.agent_model().map(str::to_string),
                metadata: conversation_metadata(task, worker_id),
            })
            .await?;

        let mut steps_taken = 0;
        for step in 1..=max_steps {
            if should_abort(&self.store, task.id).await {
                info!(task_id = %task.id, step, "Execution stopped early");
                return Err(ExecutionError::Cancelled { task_id: task.id });
            }

            self.store
                .append_log(
                    task.id,
                    LogLevel::Info,
                    &format!("Executing step {step}/{max_steps}"),
                    serde_json::json!({"step": step}),
                )
                .await?;
            self.store
                .append_conversation_message(
                    conversation.id,
                    &ConversationMessage::new(
                        MessageRole::User,
                        format!("Observation for step {step} of {}", task.problem_id),
                    ),
                )
                .await?;
            self.store
                .append_conversation_message(
                    conversation.id,
                    &ConversationMessage::new(
                        MessageRole::Assistant,
                        format!("Action taken at step {step}"),
                    ),
                )
                .await?;

            steps_taken = step;
            tokio::time::sleep(self.step_delay).await;
        }

        self.store
            .finalize_conversation(conversation.id, steps_taken * 50, steps_taken * 10, None, true)
            .await?;

        Ok(serde_json::json!({
            "success": true,
            "solution": format!("Problem {} solved", task.problem_id),
            "steps_taken": steps_taken,
            "max_steps": max_steps,
            "agent_config": task.parameters.get("agent_config").cloned()
                .unwrap_or(serde_json::Value::Null),
        }))
    }
}

// ── Orchestrator executor ───────────────────────────────────────────

/// Runs tasks through an external orchestrator process.
///
/// The child gets the problem id as its last argument plus the task context
/// in its environment. Its stdout is streamed line by line: lines that parse
/// as `{role, content}` objects become conversation messages, the final
/// `{"success": ...}` object becomes the result, and everything else becomes
/// a task log entry.
pub struct OrchestratorExecutor {
    store: Arc<dyn Store>,
    command: String,
    api_key: Option<SecretString>,
    /// Cadence of the cancellation poll while the child runs.
    cancel_poll: Duration,
}

impl OrchestratorExecutor {
    pub fn new(store: Arc<dyn Store>, command: String, api_key: Option<SecretString>) -> Self {
        Self {
            store,
            command,
            api_key,
            cancel_poll: Duration::from_secs(2),
        }
    }

    fn build_command(&self, task: &Task, worker_id: &str) -> Result<Command, ExecutionError> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ExecutionError::Process("empty orchestrator command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(parts)
            .arg(&task.problem_id)
            .env("TASK_ID", task.id.to_string())
            .env("PROBLEM_ID", &task.problem_id)
            .env("MAX_STEPS", task.max_steps().to_string())
            .env("CLUSTER_NAME", cluster_for(worker_id))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(model) = task.agent_model() {
            cmd.env("AGENT_MODEL", model);
        }
        if let Some(key) = &self.api_key {
            cmd.env("ORCHESTRATOR_API_KEY", key.expose_secret());
        }
        Ok(cmd)
    }
}

#[async_trait]
impl Executor for OrchestratorExecutor {
    async fn execute(
        &self,
        task: &Task,
        worker_id: &str,
    ) -> Result<serde_json::Value, ExecutionError> {
        info!(
            task_id = %task.id,
            problem_id = %task.problem_id,
            cluster = %cluster_for(worker_id),
            "Orchestrator execution started"
        );

        let conversation = self
            .store
            .insert_conversation(&NewConversation {
                task_id: task.id,
                model: task.agent_model().map(str::to_string),
                metadata: conversation_metadata(task, worker_id),
            })
            .await?;

        let mut child = self
            .build_command(task, worker_id)?
            .spawn()
            .map_err(|e| ExecutionError::Process(format!("spawn failed: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Process("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionError::Process("child stderr unavailable".into()))?;

        // Drain stderr concurrently so the child never blocks on a full pipe.
        let stderr_store = Arc::clone(&self.store);
        let stderr_task_id = task.id;
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = stderr_store
                    .append_log(
                        stderr_task_id,
                        LogLevel::Warn,
                        &line,
                        serde_json::json!({"stream": "stderr"}),
                    )
                    .await;
            }
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut poll = tokio::time::interval(self.cancel_poll);
        let mut result: Option<serde_json::Value> = None;
        let mut messages = 0i64;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line.map_err(|e| ExecutionError::Process(e.to_string()))? {
                        Some(line) => {
                            match serde_json::from_str::<serde_json::Value>(&line) {
                                Ok(value) if value.get("role").is_some() => {
                                    let role = value["role"]
                                        .as_str()
                                        .and_then(MessageRole::parse)
                                        .unwrap_or(MessageRole::Assistant);
                                    let content = value
                                        .get("content")
                                        .and_then(|c| c.as_str())
                                        .unwrap_or_default()
                                        .to_string();
                                    let mut message = ConversationMessage::new(role, content);
                                    if let Some(calls) = value.get("tool_calls") {
                                        message = message.with_tool_calls(calls.clone());
                                    }
                                    self.store
                                        .append_conversation_message(conversation.id, &message)
                                        .await?;
                                    messages += 1;
                                }
                                Ok(value) if value.get("success").is_some() => {
                                    result = Some(value);
                                }
                                _ => {
                                    self.store
                                        .append_log(
                                            task.id,
                                            LogLevel::Info,
                                            &line,
                                            serde_json::json!({"stream": "stdout"}),
                                        )
                                        .await?;
                                }
                            }
                        }
                        None => break,
                    }
                }
                _ = poll.tick() => {
                    if should_abort(&self.store, task.id).await {
                        let _ = child.kill().await;
                        stderr_handle.abort();
                        info!(task_id = %task.id, "Orchestrator killed after cancellation");
                        return Err(ExecutionError::Cancelled { task_id: task.id });
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ExecutionError::Process(e.to_string()))?;
        let _ = stderr_handle.await;

        let success = status.success()
            && result
                .as_ref()
                .and_then(|r| r.get("success"))
                .and_then(|s| s.as_bool())
                .unwrap_or(false);
        let tokens_prompt = result
            .as_ref()
            .and_then(|r| r.get("tokens_prompt"))
            .and_then(|t| t.as_i64())
            .unwrap_or(0);
        let tokens_completion = result
            .as_ref()
            .and_then(|r| r.get("tokens_completion"))
            .and_then(|t| t.as_i64())
            .unwrap_or(0);
        self.store
            .finalize_conversation(
                conversation.id,
                tokens_prompt,
                tokens_completion,
                None,
                success,
            )
            .await?;
        debug!(task_id = %task.id, messages, "Conversation recorded");

        if !status.success() {
            return Err(ExecutionError::Process(format!(
                "orchestrator exited with {status}"
            )));
        }
        match result {
            Some(result) => Ok(result),
            None => Err(ExecutionError::BadOutput(
                "orchestrator produced no result object".into(),
            )),
        }
    }
}
