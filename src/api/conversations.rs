//! LLM conversation endpoints.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::conversations::{ConversationFilter, MessageRole};
use crate::tasks::Page;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/llm-conversations", get(list_conversations))
        .route("/llm-conversations/stats/summary", get(stats_summary))
        .route("/llm-conversations/{id}", get(get_conversation))
        .route("/llm-conversations/{id}/messages", get(conversation_messages))
        .route(
            "/llm-conversations/task/{task_id}/conversations",
            get(task_conversations),
        )
}

#[derive(Debug, Deserialize)]
struct ConversationListParams {
    task_id: Option<Uuid>,
    model: Option<String>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

/// GET /api/v1/llm-conversations
async fn list_conversations(
    State(state): State<AppState>,
    Query(params): Query<ConversationListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = ConversationFilter {
        task_id: params.task_id,
        model: params.model,
    };
    let page = Page {
        page: params.page.max(1),
        page_size: params.page_size.clamp(1, 100),
    };
    let (conversations, total) = state.store.list_conversations(&filter, page).await?;

    Ok(Json(serde_json::json!({
        "conversations": conversations,
        "total": total,
        "page": page.page,
        "page_size": page.page_size,
    })))
}

/// GET /api/v1/llm-conversations/{id}
async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state
        .store
        .get_conversation(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Conversation {id} not found")))?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
struct MessageParams {
    role: Option<String>,
}

/// GET /api/v1/llm-conversations/{id}/messages
async fn conversation_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<MessageParams>,
) -> Result<impl IntoResponse, ApiError> {
    let role = params
        .role
        .as_deref()
        .map(|s| {
            MessageRole::parse(s)
                .ok_or_else(|| ApiError::Validation(format!("Unknown message role '{s}'")))
        })
        .transpose()?;

    let messages = state.store.conversation_messages(id, role).await?;
    Ok(Json(serde_json::json!({
        "conversation_id": id,
        "messages": messages,
    })))
}

/// GET /api/v1/llm-conversations/task/{task_id}/conversations
async fn task_conversations(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = state.store.conversations_for_task(task_id).await?;
    Ok(Json(conversations))
}

/// GET /api/v1/llm-conversations/stats/summary
async fn stats_summary(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.store.conversation_stats().await?;
    Ok(Json(stats))
}
