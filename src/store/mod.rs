//! Persistence layer — libSQL-backed async storage for tasks, logs, workers,
//! and LLM conversations.

pub mod libsql_backend;
pub mod migrations;
pub mod retry;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::Store;
