//! backupctl - operator entry points for the backup engine.

use anyhow::{Context, Result};
use backup_engine::{shutdown, utils, BackupConfig, BackupOrchestrator, HealthStatus};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "/etc/backup/backup.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a full backup
    Full,
    /// Capture the change log since the previous backup
    Incremental,
    /// Restore a full backup
    Restore {
        id: String,
        /// Database to drop, recreate and restore into (default: the primary, in place)
        #[arg(long)]
        target: Option<String>,
    },
    /// Recover the state at an RFC 3339 timestamp
    Pitr {
        time: DateTime<Utc>,
        #[arg(long)]
        target: Option<String>,
    },
    /// Delete backups outside the retention window
    Cleanup,
    /// Verify a backup's checksum; full backups are also test-restored
    Verify { id: String },
    /// Print aggregate health
    Status,
    /// List all backups, newest first
    List,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = BackupConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("backupctl v{}", env!("CARGO_PKG_VERSION"));

    let orchestrator = BackupOrchestrator::from_config(config).await?;
    let watcher = shutdown::cancel_on_signal(orchestrator.cancellation());

    let code = run(&orchestrator, args.command).await;
    watcher.abort();
    code
}

async fn run(orchestrator: &BackupOrchestrator, command: Command) -> Result<ExitCode> {
    match command {
        Command::Full => print_json(&orchestrator.create_full_backup().await?)?,
        Command::Incremental => print_json(&orchestrator.create_incremental_backup().await?)?,
        Command::Restore { id, target } => {
            print_json(&orchestrator.restore_from_backup(&id, target.as_deref()).await?)?
        }
        Command::Pitr { time, target } => {
            print_json(&orchestrator.point_in_time_restore(time, target.as_deref()).await?)?
        }
        Command::Cleanup => print_json(&orchestrator.cleanup_old_backups().await?)?,
        Command::Verify { id } => {
            let ok = orchestrator.test_backup_integrity(&id).await?;
            println!("{}", if ok { "ok" } else { "FAILED" });
            if !ok {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Status => {
            let status = orchestrator.get_backup_status().await;
            print_json(&status)?;
            if status.health_status == HealthStatus::Critical {
                return Ok(ExitCode::from(2));
            }
        }
        Command::List => {
            for record in orchestrator.list_backups().await? {
                println!(
                    "{:<40} {:<12} {:<8} {:>12} {}",
                    record.id,
                    record.backup_type,
                    if record.success { "ok" } else { "failed" },
                    record.size,
                    record.timestamp.to_rfc3339()
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
