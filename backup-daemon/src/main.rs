mod config;
mod error;
mod routes;
mod services;
mod state;

#[cfg(test)]
mod test_support;

use crate::config::DaemonConfig;
use crate::services::scheduler::BackupScheduler;
use crate::state::AppState;
use backup_engine::utils::logger;
use backup_engine::{shutdown, BackupConfig, BackupOrchestrator};
use std::sync::Arc;
use std::time::Duration;

/// How long in-flight jobs get to finalize their records after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let daemon = DaemonConfig::from_env();
    let backup_config = BackupConfig::from_file(&daemon.backup_config)?;

    let level = daemon
        .log_level
        .clone()
        .unwrap_or_else(|| backup_config.log.level.clone());
    logger::init(&level)?;
    tracing::info!(
        port = daemon.port,
        config = %daemon.backup_config.display(),
        database = %backup_config.datastore.database,
        "Starting backup daemon"
    );

    let orchestrator = Arc::new(BackupOrchestrator::from_config(backup_config).await?);
    let state = Arc::new(AppState::new(orchestrator.clone()));

    // Initialize cron scheduler
    let scheduler = if daemon.scheduler_enabled {
        match BackupScheduler::new(state.clone()).await {
            Ok(s) => {
                if let Err(e) = s.init_schedules().await {
                    tracing::warn!("Failed to initialize schedules: {}", e);
                }
                if let Err(e) = s.start().await {
                    tracing::warn!("Failed to start scheduler: {}", e);
                }
                Some(s)
            }
            Err(e) => {
                tracing::warn!("Failed to create scheduler: {}", e);
                None
            }
        }
    } else {
        tracing::info!("Scheduler disabled");
        None
    };

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", daemon.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let signal = shutdown::wait_for_signal().await;
            tracing::info!(?signal, "Shutdown requested");
        })
        .await?;

    tracing::info!("Shutting down...");
    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    // Kill external commands; running jobs finalize as failed.
    orchestrator.shutdown();
    state.tasks.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, state.tasks.wait()).await.is_err() {
        tracing::warn!(
            pending = state.tasks.len(),
            "Jobs still running after drain timeout"
        );
    }

    tracing::info!("Daemon stopped");
    Ok(())
}
