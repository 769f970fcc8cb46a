//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths, checked in order.
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "emailworker.toml",
    "./config/config.toml",
    "/etc/emailworker/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found), with environment variable overrides.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("MW_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Database
        if let Ok(val) = env::var("MW_DATABASE_KIND") {
            config.database.kind = val;
        }
        if let Ok(val) = env::var("MW_DATABASE_CONNECTION_STRING") {
            config.database.connection_string = val;
        }
        if let Ok(val) = env::var("MW_DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                config.database.max_connections = n;
            }
        }

        // Processing
        if let Ok(val) = env::var("MW_PROCESSING_POLLING_INTERVAL_S") {
            if let Ok(n) = val.parse() {
                config.processing.polling_interval_s = n;
            }
        }
        if let Ok(val) = env::var("MW_PROCESSING_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.processing.batch_size = n;
            }
        }
        if let Ok(val) = env::var("MW_PROCESSING_MAX_CONCURRENT_WORKERS") {
            if let Ok(n) = val.parse() {
                config.processing.max_concurrent_workers = n;
            }
        }
        if let Ok(val) = env::var("MW_PROCESSING_MAX_RETRY_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                config.processing.max_retry_attempts = n;
            }
        }
        if let Ok(val) = env::var("MW_PROCESSING_RETRY_DELAY_MINUTES") {
            if let Ok(n) = val.parse() {
                config.processing.retry_delay_minutes = n;
            }
        }
        if let Ok(val) = env::var("MW_PROCESSING_MAX_PROCESSING_TIME_MINUTES") {
            if let Ok(n) = val.parse() {
                config.processing.max_processing_time_minutes = n;
            }
        }
        if let Ok(val) = env::var("MW_PROCESSING_MAX_ATTACHMENT_SIZE_MB") {
            if let Ok(n) = val.parse() {
                config.processing.max_attachment_size_mb = n;
            }
        }

        // SMTP
        if let Ok(val) = env::var("MW_SMTP_HOST") {
            config.smtp.host = val;
        }
        if let Ok(val) = env::var("MW_SMTP_PORT") {
            if let Ok(n) = val.parse() {
                config.smtp.port = n;
            }
        }
        if let Ok(val) = env::var("MW_SMTP_USERNAME") {
            config.smtp.username = Some(val);
        }
        if let Ok(val) = env::var("MW_SMTP_PASSWORD") {
            config.smtp.password = Some(val);
        }
        if let Ok(val) = env::var("MW_SMTP_USE_TLS") {
            config.smtp.use_tls = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("MW_SMTP_USE_SSL") {
            config.smtp.use_ssl = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("MW_SMTP_TIMEOUT_S") {
            if let Ok(n) = val.parse() {
                config.smtp.timeout_s = n;
            }
        }
        if let Ok(val) = env::var("MW_SMTP_SENDER_EMAIL") {
            config.smtp.sender_email = val;
        }
        if let Ok(val) = env::var("MW_SMTP_SENDER_NAME") {
            config.smtp.sender_name = val;
        }

        // Cleanup
        if let Ok(val) = env::var("MW_CLEANUP_INTERVAL_HOURS") {
            if let Ok(n) = val.parse() {
                config.cleanup.cleanup_interval_hours = n;
            }
        }
        if let Ok(val) = env::var("MW_CLEANUP_TIME_UTC") {
            config.cleanup.cleanup_time_utc = val;
        }
        if let Ok(val) = env::var("MW_CLEANUP_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.cleanup.cleanup_batch_size = n;
            }
        }
        if let Ok(val) = env::var("MW_CLEANUP_ARCHIVAL_ENABLED") {
            config.cleanup.archival.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("MW_CLEANUP_ARCHIVAL_PATH") {
            config.cleanup.archival.path = val;
        }

        // Worker
        if let Ok(val) = env::var("MW_WORKER_SERVICE_NAME") {
            config.worker.service_name = val;
        }
        if let Ok(val) = env::var("MW_WORKER_SCHEDULED_CHECK_INTERVAL_MINUTES") {
            if let Ok(n) = val.parse() {
                config.worker.scheduled_check_interval_minutes = n;
            }
        }
        if let Ok(val) = env::var("MW_WORKER_HEALTH_CHECK_INTERVAL_MINUTES") {
            if let Ok(n) = val.parse() {
                config.worker.health_check_interval_minutes = n;
            }
        }
        if let Ok(val) = env::var("MW_WORKER_ALERT_EMAIL") {
            config.worker.alert_email = Some(val);
        }
        if let Ok(val) = env::var("MW_WORKER_WEBHOOK_URL") {
            config.worker.webhook_url = Some(val);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let loader = ConfigLoader::with_path("/nonexistent/path.toml");
        let config = loader.load().unwrap();
        assert_eq!(config.processing.max_concurrent_workers, 5);
        assert_eq!(config.smtp.port, 587);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[smtp]
host = "smtp.example.com"
port = 2525
sender_email = "orders@example.com"
sender_name = "Orders"

[processing]
max_concurrent_workers = 8
"#
        )
        .unwrap();

        let loader = ConfigLoader::with_path(file.path());
        let config = loader.load().unwrap();
        assert_eq!(config.smtp.host, "smtp.example.com");
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.processing.max_concurrent_workers, 8);
        // untouched section keeps its default
        assert_eq!(config.cleanup.cleanup_batch_size, 500);
    }

    #[test]
    fn test_env_override_takes_precedence_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[smtp]\nhost = \"from-file.example.com\"\n").unwrap();

        std::env::set_var("MW_SMTP_HOST", "from-env.example.com");
        let loader = ConfigLoader::with_path(file.path());
        let config = loader.load().unwrap();
        std::env::remove_var("MW_SMTP_HOST");

        assert_eq!(config.smtp.host, "from-env.example.com");
    }
}
