//! Task domain — data model for problem execution requests.

pub mod model;

pub use model::{
    LogLevel, NewTask, Page, QueueStats, Task, TaskFilter, TaskLog, TaskStats, TaskStatus,
    DEFAULT_BACKEND_TYPE,
};
