use crate::state::AppState;
use backup_engine::config::ScheduleConfig;
use backup_engine::BackupError;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Named jobs the daemon runs on a cron cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledJob {
    FullBackup,
    IncrementalBackup,
    Cleanup,
    IntegrityTest,
}

impl ScheduledJob {
    pub const ALL: [ScheduledJob; 4] = [
        Self::FullBackup,
        Self::IncrementalBackup,
        Self::Cleanup,
        Self::IntegrityTest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::FullBackup => "full_backup",
            Self::IncrementalBackup => "incremental_backup",
            Self::Cleanup => "cleanup",
            Self::IntegrityTest => "integrity_test",
        }
    }

    pub fn cron<'a>(&self, schedule: &'a ScheduleConfig) -> &'a str {
        match self {
            Self::FullBackup => &schedule.daily,
            Self::IncrementalBackup => &schedule.incremental,
            Self::Cleanup => &schedule.weekly,
            Self::IntegrityTest => &schedule.monthly,
        }
    }

    /// Run once. Failures are logged here; nothing propagates to the scheduler.
    pub async fn run(self, state: Arc<AppState>) {
        let orchestrator = &state.orchestrator;
        let outcome = match self {
            Self::FullBackup => orchestrator.create_full_backup().await.map(|_| ()),
            Self::IncrementalBackup => orchestrator.create_incremental_backup().await.map(|_| ()),
            Self::Cleanup => orchestrator.cleanup_old_backups().await.map(|_| ()),
            Self::IntegrityTest => match orchestrator.latest_full_backup().await {
                Ok(Some(latest)) => match orchestrator.test_backup_integrity(&latest.id).await {
                    Ok(true) => Ok(()),
                    Ok(false) => {
                        tracing::error!(backup_id = %latest.id, "Scheduled integrity test failed");
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                Ok(None) => {
                    tracing::warn!("No full backup to integrity-test");
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(()) => tracing::info!(job = self.name(), "Scheduled job finished"),
            Err(BackupError::Busy(holder)) => {
                tracing::warn!(job = self.name(), %holder, "Skipping scheduled run: conflicting job running")
            }
            Err(e) => tracing::error!(job = self.name(), error = %e, "Scheduled job failed"),
        }
    }
}

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl BackupScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn schedule_job(&self, job: ScheduledJob, cron_expression: &str) -> anyhow::Result<()> {
        let state = self.state.clone();

        let cron_job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                tracing::info!(job = job.name(), "Starting scheduled job");
                // Tracked so shutdown waits for the run to finalize its record.
                let tasks = state.tasks.clone();
                if let Err(e) = tasks.spawn(job.run(state)).await {
                    tracing::error!(job = job.name(), error = %e, "Scheduled job panicked");
                }
            })
        })?;

        self.scheduler.lock().await.add(cron_job).await?;
        tracing::info!(job = job.name(), cron = %cron_expression, "Job scheduled");
        Ok(())
    }

    pub async fn init_schedules(&self) -> anyhow::Result<()> {
        let schedule = self.state.orchestrator.config().schedule.clone();

        let mut count = 0;
        for job in ScheduledJob::ALL {
            let cron = job.cron(&schedule);
            if cron.trim().is_empty() {
                continue;
            }
            if let Err(e) = self.schedule_job(job, cron).await {
                tracing::error!(job = job.name(), cron = %cron, error = %e, "Failed to schedule job");
            } else {
                count += 1;
            }
        }

        tracing::info!(count, "Cron schedules initialized");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
