//! LLM conversation data model — transcripts captured during task runs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a message within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// One message in a conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
        }
    }

    pub fn with_tool_calls(mut self, calls: serde_json::Value) -> Self {
        self.tool_calls = Some(calls);
        self
    }
}

/// One agent session within a task run.
///
/// `metadata` carries `problem_id`, `worker_id`, and `cluster_id`; the store
/// records the cluster value opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConversation {
    pub id: Uuid,
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub tokens_prompt: i64,
    #[serde(default)]
    pub tokens_completion: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Request to open a conversation.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub task_id: Uuid,
    pub model: Option<String>,
    pub metadata: serde_json::Value,
}

/// Listing view without the full transcript.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub task_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub message_count: i64,
    pub tokens_prompt: i64,
    pub tokens_completion: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Filters for conversation listing.
#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub task_id: Option<Uuid>,
    pub model: Option<String>,
}

/// Aggregates for `GET /llm-conversations/stats/summary`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationStats {
    pub total_conversations: i64,
    pub total_messages: i64,
    pub total_tokens_prompt: i64,
    pub total_tokens_completion: i64,
    pub total_cost_estimate: Decimal,
    pub conversations_by_model: std::collections::HashMap<String, i64>,
}
