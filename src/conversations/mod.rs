//! LLM conversation domain — transcripts recorded by executors.

pub mod model;

pub use model::{
    ConversationFilter, ConversationMessage, ConversationStats, ConversationSummary,
    LlmConversation, MessageRole, NewConversation,
};
