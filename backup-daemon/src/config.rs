use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    /// TOML file handed to the engine
    pub backup_config: PathBuf,
    /// Overrides `log.level` from the engine config
    pub log_level: Option<String>,
    pub scheduler_enabled: bool,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            backup_config: PathBuf::from(
                std::env::var("BACKUP_CONFIG").unwrap_or_else(|_| "/etc/backup/backup.toml".into()),
            ),
            log_level: std::env::var("LOG_LEVEL").ok(),
            scheduler_enabled: std::env::var("SCHEDULER_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
        }
    }
}
