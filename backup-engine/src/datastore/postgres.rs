//! PostgreSQL through its client tools (`pg_dump`, `psql`, `createdb`, `dropdb`).
//!
//! Connection details travel as discrete arguments and the password only
//! through `PGPASSWORD`. Change capture reads the segment files the server
//! archives into `change_log_dir`.

use super::manifest::{SegmentEntry, SegmentManifest, MANIFEST_FILE};
use super::{quote_identifier, validate_target_name, CaptureWindow, Datastore, ValidationCheck, ValidationReport};
use crate::config::{DatastoreConfig, TimeoutConfig};
use crate::fs::walker::{walk_directory, FileInfo, WalkOptions};
use crate::process::{CommandFailure, CommandRunner, CommandSpec};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Segment files still being written by the server carry this suffix.
const IN_FLIGHT_SUFFIX: &str = ".partial";
const SEGMENT_EXTENSION: &str = "sql";

pub struct PostgresDatastore {
    config: DatastoreConfig,
    timeouts: TimeoutConfig,
    runner: Arc<dyn CommandRunner>,
}

impl PostgresDatastore {
    pub fn new(config: DatastoreConfig, timeouts: TimeoutConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            timeouts,
            runner,
        }
    }

    fn command(&self, program: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(program)
            .arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--username")
            .arg(&self.config.user)
            .arg("--no-password");
        if let Some(password) = &self.config.password {
            spec = spec.env("PGPASSWORD", password.expose());
        }
        spec
    }

    fn sql_file(&self, target: &str, file: &Path) -> CommandSpec {
        self.command(&self.config.restore_tool)
            .arg("--dbname")
            .arg(target)
            .args(["--no-psqlrc", "--quiet", "--set", "ON_ERROR_STOP=1", "--single-transaction"])
            .arg("--file")
            .arg(file)
    }

    fn sql_query(&self, target: &str, query: &str) -> CommandSpec {
        self.command(&self.config.restore_tool)
            .arg("--dbname")
            .arg(target)
            .args(["--no-psqlrc", "--tuples-only", "--no-align", "--command"])
            .arg(query)
    }

    async fn apply_file(&self, target: &str, file: &Path, cancel: &CancellationToken) -> Result<()> {
        self.runner
            .run(&self.sql_file(target, file), self.timeouts.restore(), cancel)
            .await
            .map_err(|e| {
                e.into_backup_error("restore", |msg| {
                    BackupError::Restore(format!("{}: {}", file.display(), msg))
                })
            })?;
        Ok(())
    }

    async fn probe(&self, target: &str, name: &str, query: &str, cancel: &CancellationToken) -> Result<ValidationCheck> {
        let outcome = self
            .runner
            .run(&self.sql_query(target, query), self.timeouts.validate(), cancel)
            .await;

        let (passed, detail) = match outcome {
            Ok(output) => match output.stdout.trim().parse::<u64>() {
                Ok(count) => (true, format!("{count} rows")),
                Err(_) => (false, format!("unexpected output {:?}", output.stdout.trim())),
            },
            Err(e @ (CommandFailure::TimedOut(_) | CommandFailure::Cancelled)) => {
                return Err(e.into_backup_error("validate", BackupError::Validation))
            }
            Err(e) => (false, e.to_string()),
        };
        Ok(ValidationCheck {
            name: name.to_string(),
            passed,
            detail,
        })
    }
}

#[async_trait]
impl Datastore for PostgresDatastore {
    fn primary(&self) -> &str {
        &self.config.database
    }

    async fn dump_full(&self, out: &Path, cancel: &CancellationToken) -> Result<()> {
        let spec = self
            .command(&self.config.dump_tool)
            .args(["--format=plain", "--no-owner", "--no-acl"])
            .arg("--dbname")
            .arg(&self.config.database)
            .stdout_file(out);

        self.runner
            .run(&spec, self.timeouts.capture(), cancel)
            .await
            .map_err(|e| e.into_backup_error("capture", BackupError::Capture))?;
        debug!(database = %self.config.database, out = %out.display(), "Dump written");
        Ok(())
    }

    async fn capture_changes(
        &self,
        window: CaptureWindow,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<SegmentManifest> {
        let source = self.config.change_log_dir.clone();
        if !tokio::fs::metadata(&source).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(BackupError::Capture(format!(
                "change log directory {} is not available",
                source.display()
            )));
        }

        let files = tokio::task::spawn_blocking(move || {
            let options = WalkOptions {
                exclude_suffixes: vec![IN_FLIGHT_SUFFIX.to_string()],
                ..WalkOptions::default()
            };
            walk_directory(&source, options)
        })
        .await
        .map_err(|e| BackupError::Capture(e.to_string()))?
        .map_err(|e| BackupError::Capture(e.to_string()))?;

        tokio::fs::create_dir_all(out_dir).await?;
        let mut entries = Vec::new();
        for file in files.iter().filter(|f| in_window(f, window)) {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            let dest = out_dir.join(&file.relative_path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&file.path, &dest)
                .await
                .map_err(|e| BackupError::Capture(format!("{}: {}", file.path.display(), e)))?;
            entries.push(SegmentEntry {
                name: file.relative_key(),
                size: file.size,
                mtime: DateTime::<Utc>::from(file.modified).timestamp(),
            });
        }

        info!(
            files = entries.len(),
            since = %window.start,
            until = %window.end,
            "Captured change log segment"
        );
        Ok(SegmentManifest::new(window.start, window.end, entries))
    }

    async fn recreate(&self, target: &str, cancel: &CancellationToken) -> Result<()> {
        self.drop_target(target, cancel).await?;
        let spec = self
            .command(&self.config.create_tool)
            .arg("--maintenance-db")
            .arg(&self.config.admin_database)
            .arg(target);
        self.runner
            .run(&spec, self.timeouts.restore(), cancel)
            .await
            .map_err(|e| e.into_backup_error("restore", BackupError::Restore))?;
        Ok(())
    }

    async fn drop_target(&self, target: &str, cancel: &CancellationToken) -> Result<()> {
        validate_target_name(target)?;
        let spec = self
            .command(&self.config.drop_tool)
            .arg("--maintenance-db")
            .arg(&self.config.admin_database)
            .arg("--if-exists")
            .arg(target);
        self.runner
            .run(&spec, self.timeouts.restore(), cancel)
            .await
            .map_err(|e| e.into_backup_error("restore", BackupError::Restore))?;
        Ok(())
    }

    async fn apply_full(&self, artifact: &Path, target: &str, cancel: &CancellationToken) -> Result<()> {
        validate_target_name(target)?;
        self.apply_file(target, artifact, cancel).await
    }

    async fn replay_segment(
        &self,
        segment_dir: &Path,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        validate_target_name(target)?;
        for file in segment_files(segment_dir).await? {
            self.apply_file(target, &file, cancel).await?;
        }
        Ok(())
    }

    async fn validate(&self, target: &str, cancel: &CancellationToken) -> Result<ValidationReport> {
        validate_target_name(target)?;
        let mut report = ValidationReport::default();

        if self.config.validation_tables.is_empty() {
            report.checks.push(self.probe(target, "connectivity", "SELECT 1", cancel).await?);
            return Ok(report);
        }

        for table in &self.config.validation_tables {
            let query = format!("SELECT count(*) FROM {}", quote_identifier(table));
            report.checks.push(self.probe(target, table, &query, cancel).await?);
        }
        Ok(report)
    }
}

fn in_window(file: &FileInfo, window: CaptureWindow) -> bool {
    let modified = DateTime::<Utc>::from(file.modified);
    modified > window.start && modified <= window.end
}

/// SQL files of a segment in replay order: the manifest's order when one
/// exists, otherwise sorted by name.
async fn segment_files(segment_dir: &Path) -> Result<Vec<PathBuf>> {
    let names: Vec<String> = match SegmentManifest::read(segment_dir).await? {
        Some(manifest) => manifest.files.into_iter().map(|f| f.name).collect(),
        None => {
            let root = segment_dir.to_path_buf();
            tokio::task::spawn_blocking(move || walk_directory(&root, WalkOptions::default()))
                .await
                .map_err(|e| BackupError::Restore(e.to_string()))??
                .iter()
                .map(|f| f.relative_key())
                .filter(|name| name != MANIFEST_FILE)
                .collect()
        }
    };

    Ok(names
        .into_iter()
        .filter(|name| {
            Path::new(name).extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION)
        })
        .map(|name| segment_dir.join(name))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Redacted;
    use crate::process::CommandOutput;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    /// Records every command and answers probes with a fixed row count.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<CommandSpec>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            spec: &CommandSpec,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> std::result::Result<CommandOutput, CommandFailure> {
            self.calls.lock().unwrap().push(spec.clone());
            let rendered = spec.display();
            if let Some(needle) = self.fail_on {
                if rendered.contains(needle) {
                    return Err(CommandFailure::Exit {
                        code: Some(1),
                        stderr: format!("relation {needle} does not exist"),
                    });
                }
            }
            let stdout = if rendered.contains("--command") { "42\n" } else { "" };
            Ok(CommandOutput {
                status_code: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        }
    }

    fn datastore(runner: Arc<ScriptedRunner>, change_log_dir: &Path, tables: &[&str]) -> PostgresDatastore {
        let config = DatastoreConfig {
            database: "school".into(),
            password: Some(Redacted("hunter2".into())),
            change_log_dir: change_log_dir.to_path_buf(),
            validation_tables: tables.iter().map(|t| t.to_string()).collect(),
            ..DatastoreConfig::default()
        };
        PostgresDatastore::new(config, TimeoutConfig::default(), runner)
    }

    #[tokio::test]
    async fn test_dump_passes_password_through_environment_only() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let store = datastore(runner.clone(), dir.path(), &[]);

        let out = dir.path().join("dump.sql");
        store.dump_full(&out, &CancellationToken::new()).await.unwrap();

        let calls = runner.calls.lock().unwrap();
        let spec = &calls[0];
        assert_eq!(spec.program, "pg_dump");
        assert_eq!(spec.stdout_file.as_deref(), Some(out.as_path()));
        assert!(!spec.display().contains("hunter2"));
        assert!(spec.envs.iter().any(|(k, v)| k == "PGPASSWORD" && v == "hunter2"));
    }

    #[tokio::test]
    async fn test_recreate_drops_then_creates() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let store = datastore(runner.clone(), dir.path(), &[]);

        store.recreate("school_restore", &CancellationToken::new()).await.unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].program, "dropdb");
        assert!(calls[0].display().contains("--if-exists school_restore"));
        assert_eq!(calls[1].program, "createdb");
    }

    #[tokio::test]
    async fn test_option_like_target_is_refused_before_spawning() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let store = datastore(runner.clone(), dir.path(), &[]);

        assert!(store.drop_target("--all", &CancellationToken::new()).await.is_err());
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capture_copies_only_files_inside_window() {
        let source = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::write(source.path().join("0001.sql"), b"insert 1").unwrap();
        std::fs::write(source.path().join("0002.sql"), b"insert 2").unwrap();
        std::fs::write(source.path().join("0003.sql.partial"), b"in flight").unwrap();

        let old = std::fs::File::options()
            .write(true)
            .open(source.path().join("0001.sql"))
            .unwrap();
        old.set_modified(SystemTime::now() - Duration::from_secs(3600)).unwrap();

        let runner = Arc::new(ScriptedRunner::default());
        let store = datastore(runner, source.path(), &[]);
        let now = Utc::now();
        let window = CaptureWindow {
            start: now - chrono::Duration::minutes(30),
            end: now + chrono::Duration::minutes(1),
        };

        let run_dir = out.path().join("run");
        let manifest = store
            .capture_changes(window, &run_dir, &CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<&str> = manifest.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["0002.sql"]);
        assert!(run_dir.join("0002.sql").exists());
        assert!(!run_dir.join("0001.sql").exists());
        assert!(!run_dir.join("0003.sql.partial").exists());
    }

    #[tokio::test]
    async fn test_capture_without_change_log_dir_is_capture_error() {
        let dir = TempDir::new().unwrap();
        let store = datastore(Arc::new(ScriptedRunner::default()), &dir.path().join("missing"), &[]);
        let now = Utc::now();
        let err = store
            .capture_changes(
                CaptureWindow { start: now, end: now },
                &dir.path().join("run"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Capture(_)));
    }

    #[tokio::test]
    async fn test_replay_follows_manifest_order() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        for name in ["a.sql", "b.sql"] {
            std::fs::write(dir.path().join(name), b"--").unwrap();
        }
        SegmentManifest::new(
            now,
            now,
            vec![
                SegmentEntry { name: "b.sql".into(), size: 2, mtime: 0 },
                SegmentEntry { name: "a.sql".into(), size: 2, mtime: 0 },
            ],
        )
        .write(dir.path())
        .await
        .unwrap();

        let runner = Arc::new(ScriptedRunner::default());
        let store = datastore(runner.clone(), dir.path(), &[]);
        store
            .replay_segment(dir.path(), "school_restore", &CancellationToken::new())
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].display().ends_with("b.sql"));
        assert!(calls[1].display().ends_with("a.sql"));
        assert!(calls[0].display().contains("ON_ERROR_STOP=1"));
    }

    #[tokio::test]
    async fn test_validation_reports_failing_tables() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner {
            fail_on: Some("contracts"),
            ..ScriptedRunner::default()
        });
        let store = datastore(runner, dir.path(), &["students", "contracts"]);

        let report = store
            .validate("school_restore", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.checks.len(), 2);
        assert!(report.checks[0].passed);
        assert_eq!(report.checks[0].detail, "42 rows");
        assert!(!report.checks[1].passed);
    }
}
