//! Worker manager — owns a pool of in-process claim loops.
//!
//! Each logical worker is one tokio task running a claim loop against the
//! store. The manager spawns, scales, and drains them; the store stays the
//! source of truth for worker state as seen from outside.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{ExecutionError, StoreError};
use crate::store::Store;
use crate::tasks::Task;
use crate::workers::executor::Executor;
use crate::workers::model::{
    internal_worker_id, Heartbeat, WorkerCapabilities, WorkerRegistration, WorkerStatus,
};

/// Hard ceiling on the pool size.
pub const MAX_WORKERS: usize = 50;

/// How long `stop()` waits for loops to drain before aborting them.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// A claim loop abandons after this many consecutive store errors.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Loop-local lifecycle phase, exported for the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Starting,
    Idle,
    Claiming,
    Busy,
    Draining,
    Stopped,
}

/// One spawned claim loop.
struct WorkerHandle {
    worker_id: String,
    handle: JoinHandle<()>,
    drain_tx: watch::Sender<bool>,
}

/// Snapshot for `GET /workers/internal/status`.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub num_workers: usize,
    pub workers: HashMap<String, LoopPhase>,
}

/// Manages internal workers that run as background tasks.
pub struct WorkerManager {
    settings: Settings,
    store: Arc<dyn Store>,
    executor: Arc<dyn Executor>,
    /// Spawned loops keyed by worker index (1-based).
    workers: Arc<RwLock<BTreeMap<usize, WorkerHandle>>>,
    /// Loop phases, written by the loops themselves.
    phases: Arc<RwLock<HashMap<String, LoopPhase>>>,
}

impl WorkerManager {
    pub fn new(settings: Settings, store: Arc<dyn Store>, executor: Arc<dyn Executor>) -> Self {
        Self {
            settings,
            store,
            executor,
            workers: Arc::new(RwLock::new(BTreeMap::new())),
            phases: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the configured number of workers. No-op if any are running.
    pub async fn start(&self) -> Result<usize, StoreError> {
        let target = self.settings.num_internal_workers.min(MAX_WORKERS);
        {
            let workers = self.workers.read().await;
            if !workers.is_empty() {
                warn!("Worker manager already running");
                return Ok(workers.len());
            }
        }

        info!(num_workers = target, "Starting internal workers");
        for index in 1..=target {
            self.spawn_worker(index).await;
        }
        Ok(target)
    }

    /// Scale the pool to exactly `target` workers.
    ///
    /// Returns `(previous, current)` counts. Loops above the target are
    /// signalled to drain: they finish their current task, skip the next
    /// claim, and deregister.
    pub async fn set_count(&self, target: usize) -> Result<(usize, usize), StoreError> {
        if target > MAX_WORKERS {
            return Err(StoreError::Validation(format!(
                "num_workers must be between 0 and {MAX_WORKERS}"
            )));
        }

        let previous = self.workers.read().await.len();

        if target > previous {
            // Spawn the lowest free indices.
            let mut spawned = previous;
            let mut index = 1;
            while spawned < target {
                let occupied = self.workers.read().await.contains_key(&index);
                if !occupied {
                    self.spawn_worker(index).await;
                    spawned += 1;
                }
                index += 1;
            }
            info!(from = previous, to = target, "Scaled workers up");
        } else if target < previous {
            let to_drain: Vec<usize> = {
                let workers = self.workers.read().await;
                workers.keys().rev().take(previous - target).copied().collect()
            };
            let mut workers = self.workers.write().await;
            for index in to_drain {
                if let Some(handle) = workers.remove(&index) {
                    let _ = handle.drain_tx.send(true);
                    debug!(worker_id = %handle.worker_id, "Worker draining");
                }
            }
            info!(from = previous, to = target, "Scaled workers down");
        }

        Ok((previous, target))
    }

    /// Drain all loops, wait up to the shutdown budget, then abort stragglers
    /// and mark them offline.
    pub async fn stop(&self) {
        let drained: Vec<WorkerHandle> = {
            let mut workers = self.workers.write().await;
            std::mem::take(&mut *workers).into_values().collect()
        };
        if drained.is_empty() {
            return;
        }

        info!(num_workers = drained.len(), "Stopping internal workers");
        for handle in &drained {
            let _ = handle.drain_tx.send(true);
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_BUDGET;
        for handle in drained {
            let abort = handle.handle.abort_handle();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle.handle).await.is_err() {
                warn!(worker_id = %handle.worker_id, "Worker did not drain in time, aborting");
                abort.abort();
                let _ = self
                    .store
                    .heartbeat(
                        &handle.worker_id,
                        &Heartbeat {
                            status: WorkerStatus::Offline,
                            current_task_id: None,
                        },
                    )
                    .await;
            }
        }

        self.phases.write().await.clear();
        info!("Internal workers stopped");
    }

    /// Current pool snapshot.
    pub async fn status(&self) -> ManagerStatus {
        let workers = self.workers.read().await;
        let phases = self.phases.read().await;
        let mut map = HashMap::new();
        for handle in workers.values() {
            let phase = phases
                .get(&handle.worker_id)
                .copied()
                .unwrap_or(LoopPhase::Starting);
            map.insert(handle.worker_id.clone(), phase);
        }
        ManagerStatus {
            running: !workers.is_empty(),
            num_workers: workers.len(),
            workers: map,
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    async fn spawn_worker(&self, index: usize) {
        let worker_id = internal_worker_id(index);
        let (drain_tx, drain_rx) = watch::channel(false);

        let loop_ctx = WorkerLoop {
            worker_id: worker_id.clone(),
            store: Arc::clone(&self.store),
            executor: Arc::clone(&self.executor),
            settings: self.settings.clone(),
            phases: Arc::clone(&self.phases),
            drain_rx,
        };
        let handle = tokio::spawn(loop_ctx.run());

        self.workers.write().await.insert(
            index,
            WorkerHandle {
                worker_id: worker_id.clone(),
                handle,
                drain_tx,
            },
        );
        info!(worker_id = %worker_id, "Worker started");
    }
}

/// State owned by one claim loop.
struct WorkerLoop {
    worker_id: String,
    store: Arc<dyn Store>,
    executor: Arc<dyn Executor>,
    settings: Settings,
    phases: Arc<RwLock<HashMap<String, LoopPhase>>>,
    drain_rx: watch::Receiver<bool>,
}

impl WorkerLoop {
    async fn set_phase(&self, phase: LoopPhase) {
        self.phases
            .write()
            .await
            .insert(self.worker_id.clone(), phase);
    }

    fn draining(&self) -> bool {
        *self.drain_rx.borrow()
    }

    /// Poll interval with jitter so a pool of loops spreads its claims.
    fn poll_delay(&self) -> Duration {
        let base = self.settings.worker_poll_interval;
        let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 2).max(1));
        base + Duration::from_millis(jitter_ms)
    }

    async fn run(self) {
        self.set_phase(LoopPhase::Starting).await;

        let registration = WorkerRegistration {
            worker_id: self.worker_id.clone(),
            backend_type: "internal".into(),
            capabilities: WorkerCapabilities::default(),
            metadata: serde_json::json!({"type": "internal", "process": "api"}),
        };
        if let Err(e) = self.store.upsert_worker(&registration).await {
            error!(worker_id = %self.worker_id, error = %e, "Worker registration failed");
            self.set_phase(LoopPhase::Stopped).await;
            return;
        }

        let mut consecutive_errors: u32 = 0;
        loop {
            if self.draining() {
                break;
            }

            self.set_phase(LoopPhase::Claiming).await;
            match self.store.claim_next(&self.worker_id).await {
                Ok(Some(task)) => {
                    consecutive_errors = 0;
                    self.set_phase(LoopPhase::Busy).await;
                    self.run_task(task).await;
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    self.set_phase(LoopPhase::Idle).await;
                    let _ = self
                        .store
                        .heartbeat(
                            &self.worker_id,
                            &Heartbeat {
                                status: WorkerStatus::Idle,
                                current_task_id: None,
                            },
                        )
                        .await;
                    tokio::time::sleep(self.poll_delay()).await;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        worker_id = %self.worker_id,
                        error = %e,
                        consecutive_errors,
                        "Claim loop error"
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        error!(worker_id = %self.worker_id, "Too many errors, stopping loop");
                        break;
                    }
                    tokio::time::sleep(self.settings.worker_poll_interval * 2).await;
                }
            }
        }

        self.set_phase(LoopPhase::Draining).await;
        let _ = self
            .store
            .heartbeat(
                &self.worker_id,
                &Heartbeat {
                    status: WorkerStatus::Offline,
                    current_task_id: None,
                },
            )
            .await;
        self.set_phase(LoopPhase::Stopped).await;
        info!(worker_id = %self.worker_id, "Worker loop stopped");
    }

    /// Execute one claimed task, heartbeating while it runs, and record the
    /// outcome. Executor failures become `fail_task`; they never take the
    /// loop down.
    async fn run_task(&self, task: Task) {
        let task_id = task.id;
        let heartbeat_every = self.settings.worker_heartbeat_timeout / 3;

        let exec = self.executor.execute(&task, &self.worker_id);
        tokio::pin!(exec);
        let mut ticker = tokio::time::interval(heartbeat_every);
        ticker.tick().await; // first tick fires immediately

        let outcome = loop {
            tokio::select! {
                result = &mut exec => break result,
                _ = ticker.tick() => {
                    let _ = self
                        .store
                        .heartbeat(
                            &self.worker_id,
                            &Heartbeat {
                                status: WorkerStatus::Busy,
                                current_task_id: Some(task_id),
                            },
                        )
                        .await;
                }
            }
        };

        match outcome {
            Ok(result) => match self
                .store
                .complete_task(task_id, &self.worker_id, result)
                .await
            {
                Ok(_) => {
                    info!(worker_id = %self.worker_id, task_id = %task_id, "Task finished")
                }
                Err(StoreError::Conflict(reason)) => {
                    // The sweeper or a cancel got there first.
                    debug!(task_id = %task_id, reason, "Completion superseded");
                }
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Failed to record completion")
                }
            },
            Err(ExecutionError::Cancelled { .. }) => {
                info!(worker_id = %self.worker_id, task_id = %task_id, "Task stopped early");
                let _ = self
                    .store
                    .heartbeat(
                        &self.worker_id,
                        &Heartbeat {
                            status: WorkerStatus::Idle,
                            current_task_id: None,
                        },
                    )
                    .await;
            }
            Err(e) => {
                let details = serde_json::json!({"error": e.to_string()});
                match self
                    .store
                    .fail_task(task_id, &self.worker_id, details)
                    .await
                {
                    Ok(_) | Err(StoreError::Conflict(_)) => {}
                    Err(store_err) => {
                        error!(task_id = %task_id, error = %store_err, "Failed to record failure")
                    }
                }
            }
        }
    }
}
