use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use task_executor::api::{self, AppState};
use task_executor::config::Settings;
use task_executor::store::{LibSqlStore, Store};
use task_executor::workers::{
    Executor, OrchestratorExecutor, StubExecutor, Sweeper, WorkerManager,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Startup failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env();
    info!(
        database = %settings.database_url,
        addr = %settings.http_addr,
        num_workers = settings.num_internal_workers,
        "Task executor starting"
    );

    let store: Arc<dyn Store> = if settings.database_url == ":memory:" {
        Arc::new(LibSqlStore::new_memory(settings.worker_heartbeat_timeout).await?)
    } else {
        Arc::new(
            LibSqlStore::new_local(
                Path::new(&settings.database_url),
                settings.worker_heartbeat_timeout,
            )
            .await?,
        )
    };

    let executor: Arc<dyn Executor> = match &settings.orchestrator_cmd {
        Some(cmd) => {
            info!(command = %cmd, "Using orchestrator executor");
            Arc::new(OrchestratorExecutor::new(
                Arc::clone(&store),
                cmd.clone(),
                settings.orchestrator_api_key.clone(),
            ))
        }
        None => {
            info!("No orchestrator command configured, using stub executor");
            Arc::new(StubExecutor::new(Arc::clone(&store)))
        }
    };

    let manager = Arc::new(WorkerManager::new(
        settings.clone(),
        Arc::clone(&store),
        executor,
    ));
    if settings.auto_start_workers {
        manager.start().await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_handle = settings.enable_background_tasks.then(|| {
        Sweeper::new(
            Arc::clone(&store),
            settings.timeout_check_interval,
            settings.worker_heartbeat_timeout,
        )
        .spawn(shutdown_rx)
    });

    let state = AppState::new(Arc::clone(&store), Arc::clone(&manager), settings.clone());
    let draining = Arc::clone(&state.draining);
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&settings.http_addr).await?;
    info!(addr = %settings.http_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining");
            draining.store(true, Ordering::Relaxed);
        })
        .await?;

    // Drain workers and the sweeper after the server stops accepting.
    manager.stop().await;
    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }

    info!("Task executor stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
