use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use message_dispatch_service::config::Settings;
use message_dispatch_service::server::{create_app, AppState};
use message_dispatch_service::shutdown::{GracefulShutdown, ShutdownConfig};
use message_dispatch_service::tasks::{MaintenanceConfig, MaintenanceTask};
use message_dispatch_service::telemetry::init_telemetry;
use message_dispatch_service::worker::{DispatchConfig, DispatchWorker, WorkerPool, WorkerPoolConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!(
        queue_backend = %settings.queue.backend,
        ratelimit_backend = %settings.ratelimit.backend,
        delivery_backend = %settings.delivery.backend,
        "Configuration loaded"
    );

    // Create application state
    let state = AppState::new(settings.clone())?;
    tracing::info!("Application state initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    // Start worker pool in background
    let worker_handle = if settings.worker.enabled {
        let worker = Arc::new(DispatchWorker::new(
            state.queue.clone(),
            state.delivery.clone(),
            state.reporter.clone(),
            DispatchConfig::from(&settings.worker),
        ));
        let pool = WorkerPool::new(
            state.queue.clone(),
            worker,
            WorkerPoolConfig::from_settings(&settings.worker, &settings.queue),
        );
        let shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move { pool.run(shutdown_rx).await }))
    } else {
        tracing::warn!("Worker pool disabled, messages will only be queued");
        None
    };

    // Start maintenance task in background
    let maintenance_task = MaintenanceTask::new(
        MaintenanceConfig::from(&settings),
        state.rate_limiter.clone(),
        state.queue.clone(),
        state.status_store.clone(),
        state.reporter.clone(),
        shutdown_tx.subscribe(),
    );
    let maintenance_handle = tokio::spawn(maintenance_task.run());

    let graceful = GracefulShutdown::new(
        shutdown_tx.clone(),
        worker_handle,
        state.reporter.clone(),
        ShutdownConfig::from(&settings.worker),
    );

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server until a termination signal arrives
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop workers, drain in-flight batches, flush status
    let result = graceful.execute("server shutdown").await;
    if !result.success {
        tracing::warn!("Shutdown completed with unfinished work");
    }
    let _ = maintenance_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
