//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`BACKUP_<SECTION>__<KEY>`, e.g. `BACKUP_STORAGE__RETENTION_DAYS=45`).

use crate::archive::EncryptionKey;
use crate::remote::RemoteTarget;
use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub datastore: DatastoreConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// A configuration value that must never show up in logs.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Redacted(pub String);

impl Redacted {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Redacted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    /// Handed to child processes through the environment, never argv
    #[serde(default)]
    pub password: Option<Redacted>,

    /// Name of the primary database
    #[serde(default)]
    pub database: String,

    /// Directory the datastore streams change-log segment files into
    #[serde(default = "default_change_log_dir")]
    pub change_log_dir: PathBuf,

    #[serde(default = "default_dump_tool")]
    pub dump_tool: String,

    /// SQL client used to apply dumps, replay segments and run probes
    #[serde(default = "default_restore_tool")]
    pub restore_tool: String,

    #[serde(default = "default_create_tool")]
    pub create_tool: String,

    #[serde(default = "default_drop_tool")]
    pub drop_tool: String,

    /// Maintenance database used while dropping/creating targets
    #[serde(default = "default_admin_database")]
    pub admin_database: String,

    /// Core tables probed after every restore
    #[serde(default)]
    pub validation_tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// zstd level (1-22); 0 disables compression
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// 32-byte key as 64 hex chars or base64; absent disables encryption
    #[serde(default)]
    pub encryption_key: Option<Redacted>,

    /// `s3://bucket/prefix` or a directory for off-site copies
    #[serde(default)]
    pub remote_target: Option<String>,

    /// Endpoint of an S3-compatible store; credentials and region come from the AWS environment
    #[serde(default)]
    pub remote_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Full backup
    #[serde(default = "default_daily_cron")]
    pub daily: String,

    #[serde(default = "default_incremental_cron")]
    pub incremental: String,

    /// Retention cleanup
    #[serde(default = "default_weekly_cron")]
    pub weekly: String,

    /// Integrity test of the latest full backup
    #[serde(default = "default_monthly_cron")]
    pub monthly: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_warning_after_hours")]
    pub warning_after_hours: i64,

    #[serde(default = "default_critical_after_hours")]
    pub critical_after_hours: i64,

    #[serde(default = "default_failure_window_days")]
    pub failure_window_days: i64,

    #[serde(default = "default_failure_warning_count")]
    pub failure_warning_count: usize,

    #[serde(default = "default_failure_critical_count")]
    pub failure_critical_count: usize,
}

/// Per-stage timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_capture_timeout")]
    pub capture: u64,
    #[serde(default = "default_transform_timeout")]
    pub compress: u64,
    #[serde(default = "default_transform_timeout")]
    pub encrypt: u64,
    #[serde(default = "default_upload_timeout")]
    pub upload: u64,
    #[serde(default = "default_restore_timeout")]
    pub restore: u64,
    #[serde(default = "default_validate_timeout")]
    pub validate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_change_log_dir() -> PathBuf {
    PathBuf::from("/var/lib/postgresql/changes")
}

fn default_dump_tool() -> String {
    "pg_dump".to_string()
}

fn default_restore_tool() -> String {
    "psql".to_string()
}

fn default_create_tool() -> String {
    "createdb".to_string()
}

fn default_drop_tool() -> String {
    "dropdb".to_string()
}

fn default_admin_database() -> String {
    "postgres".to_string()
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/backups/database")
}

fn default_retention_days() -> u32 {
    30
}

fn default_compression_level() -> i32 {
    3
}

fn default_daily_cron() -> String {
    "0 0 2 * * *".to_string()
}

fn default_incremental_cron() -> String {
    "0 0 */4 * * *".to_string()
}

fn default_weekly_cron() -> String {
    "0 0 3 * * Sun".to_string()
}

fn default_monthly_cron() -> String {
    "0 0 4 1 * *".to_string()
}

fn default_warning_after_hours() -> i64 {
    24
}

fn default_critical_after_hours() -> i64 {
    48
}

fn default_failure_window_days() -> i64 {
    7
}

fn default_failure_warning_count() -> usize {
    1
}

fn default_failure_critical_count() -> usize {
    3
}

fn default_capture_timeout() -> u64 {
    4 * 60 * 60
}

fn default_transform_timeout() -> u64 {
    60 * 60
}

fn default_upload_timeout() -> u64 {
    2 * 60 * 60
}

fn default_restore_timeout() -> u64 {
    6 * 60 * 60
}

fn default_validate_timeout() -> u64 {
    5 * 60
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_entries() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: None,
            database: String::new(),
            change_log_dir: default_change_log_dir(),
            dump_tool: default_dump_tool(),
            restore_tool: default_restore_tool(),
            create_tool: default_create_tool(),
            drop_tool: default_drop_tool(),
            admin_database: default_admin_database(),
            validation_tables: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            retention_days: default_retention_days(),
            compression_level: default_compression_level(),
            encryption_key: None,
            remote_target: None,
            remote_endpoint: None,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily: default_daily_cron(),
            incremental: default_incremental_cron(),
            weekly: default_weekly_cron(),
            monthly: default_monthly_cron(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            warning_after_hours: default_warning_after_hours(),
            critical_after_hours: default_critical_after_hours(),
            failure_window_days: default_failure_window_days(),
            failure_warning_count: default_failure_warning_count(),
            failure_critical_count: default_failure_critical_count(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            capture: default_capture_timeout(),
            compress: default_transform_timeout(),
            encrypt: default_transform_timeout(),
            upload: default_upload_timeout(),
            restore: default_restore_timeout(),
            validate: default_validate_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_entries(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TimeoutConfig {
    pub fn capture(&self) -> Duration {
        Duration::from_secs(self.capture)
    }

    pub fn compress(&self) -> Duration {
        Duration::from_secs(self.compress)
    }

    pub fn encrypt(&self) -> Duration {
        Duration::from_secs(self.encrypt)
    }

    pub fn upload(&self) -> Duration {
        Duration::from_secs(self.upload)
    }

    pub fn restore(&self) -> Duration {
        Duration::from_secs(self.restore)
    }

    pub fn validate(&self) -> Duration {
        Duration::from_secs(self.validate)
    }
}

impl BackupConfig {
    /// Load configuration from a TOML file, apply `BACKUP_*` overrides and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("BACKUP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BackupError::Configuration(format!("{}: {}", path.display(), e)))?;

        let config: BackupConfig = settings
            .try_deserialize()
            .map_err(|e| BackupError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: BackupConfig =
            toml::from_str(content).map_err(|e| BackupError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no job could run with.
    pub fn validate(&self) -> Result<()> {
        if self.datastore.database.trim().is_empty() {
            return Err(BackupError::Configuration(
                "datastore.database must be set".into(),
            ));
        }
        if self.datastore.port == 0 {
            return Err(BackupError::Configuration("datastore.port must be non-zero".into()));
        }
        if self.datastore.host.trim().is_empty() {
            return Err(BackupError::Configuration("datastore.host must be set".into()));
        }
        if self.storage.backup_dir.as_os_str().is_empty() {
            return Err(BackupError::Configuration("storage.backup_dir must be set".into()));
        }
        if !(0..=22).contains(&self.storage.compression_level) {
            return Err(BackupError::Configuration(format!(
                "storage.compression_level must be within 0-22, got {}",
                self.storage.compression_level
            )));
        }
        if let Some(key) = &self.storage.encryption_key {
            EncryptionKey::parse(key.expose())?;
        }
        if let Some(target) = &self.storage.remote_target {
            RemoteTarget::parse(target)?;
        }
        if self.health.warning_after_hours > self.health.critical_after_hours {
            return Err(BackupError::Configuration(
                "health.warning_after_hours must not exceed critical_after_hours".into(),
            ));
        }
        Ok(())
    }

    pub fn compression_enabled(&self) -> bool {
        self.storage.compression_level > 0
    }

    pub fn encryption_enabled(&self) -> bool {
        self.storage.encryption_key.is_some()
    }

    pub fn full_dir(&self) -> PathBuf {
        self.storage.backup_dir.join("full")
    }

    pub fn incremental_dir(&self) -> PathBuf {
        self.storage.backup_dir.join("incremental")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.storage.backup_dir.join("logs")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.storage.backup_dir.join("temp")
    }

    /// Create the on-disk layout: `full/`, `incremental/`, `logs/`, `temp/`.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.full_dir(),
            self.incremental_dir(),
            self.logs_dir(),
            self.temp_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = BackupConfig::from_toml(
            r#"
            [datastore]
            database = "school"
            "#,
        )
        .unwrap();

        assert_eq!(config.datastore.port, 5432);
        assert_eq!(config.storage.retention_days, 30);
        assert_eq!(config.health.critical_after_hours, 48);
        assert!(config.compression_enabled());
        assert!(!config.encryption_enabled());
        assert_eq!(config.logs_dir(), PathBuf::from("/var/backups/database/logs"));
    }

    #[test]
    fn test_missing_database_is_rejected() {
        let err = BackupConfig::from_toml("").unwrap_err();
        assert!(matches!(err, BackupError::Configuration(_)));
    }

    #[test]
    fn test_invalid_compression_level_is_rejected() {
        let err = BackupConfig::from_toml(
            r#"
            [datastore]
            database = "school"
            [storage]
            compression_level = 40
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("compression_level"));
    }

    #[test]
    fn test_malformed_encryption_key_is_rejected() {
        let err = BackupConfig::from_toml(
            r#"
            [datastore]
            database = "school"
            [storage]
            encryption_key = "too-short"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::Configuration(_)));
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let config = BackupConfig::from_toml(
            r#"
            [datastore]
            database = "school"
            password = "hunter2"
            "#,
        )
        .unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_from_file_reads_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("backup.toml");
        std::fs::write(
            &path,
            "[datastore]\ndatabase = \"school\"\n[storage]\nretention_days = 14\n",
        )
        .unwrap();

        let config = BackupConfig::from_file(&path).unwrap();
        assert_eq!(config.storage.retention_days, 14);
    }
}
