//! Worker subsystem — registry model, in-process pool, executors, sweeper.

pub mod executor;
pub mod manager;
pub mod model;
pub mod sweeper;

pub use executor::{Executor, OrchestratorExecutor, StubExecutor};
pub use manager::{ManagerStatus, WorkerManager, MAX_WORKERS};
pub use model::{Heartbeat, Worker, WorkerCapabilities, WorkerRegistration, WorkerStatus};
pub use sweeper::Sweeper;
