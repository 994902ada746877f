use backup_engine::BackupOrchestrator;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::task::TaskTracker;

pub struct AppState {
    pub orchestrator: Arc<BackupOrchestrator>,
    pub started_at: Instant,
    /// Jobs started from HTTP triggers or the scheduler; drained on shutdown
    pub tasks: TaskTracker,
}

impl AppState {
    pub fn new(orchestrator: Arc<BackupOrchestrator>) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
            tasks: TaskTracker::new(),
        }
    }

    /// Run a job off the request path, logging how it ended.
    pub fn spawn_job<F, T, E>(&self, name: &'static str, job: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        self.tasks.spawn(async move {
            match job.await {
                Ok(_) => tracing::info!(job = name, "Job finished"),
                Err(e) => tracing::error!(job = name, error = %e, "Job failed"),
            }
        });
    }
}
