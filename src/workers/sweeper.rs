//! Timeout sweeper — enforces task deadlines and worker liveness.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::store::Store;

/// Periodic job that expires overdue running tasks and marks workers with
/// lapsed heartbeats offline. Both passes are idempotent, so overlapping
/// sweeps cannot double-apply.
pub struct Sweeper {
    store: Arc<dyn Store>,
    interval: Duration,
    heartbeat_timeout: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<dyn Store>, interval: Duration, heartbeat_timeout: Duration) -> Self {
        Self {
            store,
            interval,
            heartbeat_timeout,
        }
    }

    /// Run one sweep pass. Failures are logged, not propagated; the next
    /// tick retries.
    pub async fn sweep_once(&self) {
        let now = Utc::now();

        match self.store.expire_running(now).await {
            Ok(expired) if !expired.is_empty() => {
                info!(count = expired.len(), "Expired overdue tasks");
            }
            Ok(_) => debug!("No overdue tasks"),
            Err(e) => error!(error = %e, "Timeout sweep failed"),
        }

        match self
            .store
            .mark_stale_workers_offline(now, self.heartbeat_timeout)
            .await
        {
            Ok(stale) if !stale.is_empty() => {
                info!(count = stale.len(), "Marked stale workers offline");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Liveness sweep failed"),
        }
    }

    /// Spawn the sweep loop; it stops when `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_secs = self.interval.as_secs(), "Timeout sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep_once().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Timeout sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::store::LibSqlStore;
    use crate::tasks::{NewTask, TaskStatus};
    use crate::workers::model::{WorkerCapabilities, WorkerRegistration};

    #[tokio::test]
    async fn sweep_expires_and_marks_offline() {
        let store: Arc<dyn Store> = Arc::new(
            LibSqlStore::new_memory(Duration::from_secs(60))
                .await
                .unwrap(),
        );
        store
            .upsert_worker(&WorkerRegistration {
                worker_id: "worker-001-kind".into(),
                backend_type: "internal".into(),
                capabilities: WorkerCapabilities::default(),
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        let new = NewTask {
            problem_id: "slow".into(),
            parameters: serde_json::json!({"timeout_minutes": 0.0001}),
            priority: None,
        };
        let (params, backend, priority) = new.resolve(&Settings::default());
        store
            .insert_task("slow", &params, &backend, priority)
            .await
            .unwrap();
        let task = store.claim_next("worker-001-kind").await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        // Zero heartbeat budget makes the worker instantly stale.
        let sweeper = Sweeper::new(
            Arc::clone(&store),
            Duration::from_secs(60),
            Duration::from_secs(0),
        );
        sweeper.sweep_once().await;

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);

        // The expiry refreshed the worker's heartbeat, so a second sweep is
        // what sees it lapse under the zero-second budget.
        tokio::time::sleep(Duration::from_millis(5)).await;
        sweeper.sweep_once().await;

        let worker = store.get_worker("worker-001-kind").await.unwrap().unwrap();
        assert_eq!(
            worker.status,
            crate::workers::model::WorkerStatus::Offline
        );
    }
}
