//! Email worker configuration system.
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub processing: ProcessingConfig,
    pub smtp: SmtpConfig,
    pub cleanup: CleanupConfig,
    pub worker: WorkerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            processing: ProcessingConfig::default(),
            smtp: SmtpConfig::default(),
            cleanup: CleanupConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// "sqlite" or "postgres"
    pub kind: String,
    pub connection_string: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: "sqlite".to_string(),
            connection_string: "sqlite://emailworker.db".to_string(),
            max_connections: 10,
        }
    }
}

/// Processing / dispatch loop configuration (§6 Configuration surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub polling_interval_s: u64,
    pub batch_size: u32,
    pub max_concurrent_workers: usize,
    pub max_retry_attempts: i32,
    pub retry_delay_minutes: i64,
    pub max_processing_time_minutes: i64,
    pub max_attachment_size_mb: u64,
    pub max_email_size_mb: u64,
    pub max_recipients_per_email: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            polling_interval_s: 30,
            batch_size: 20,
            max_concurrent_workers: 5,
            max_retry_attempts: 3,
            retry_delay_minutes: 5,
            max_processing_time_minutes: 10,
            max_attachment_size_mb: 25,
            max_email_size_mb: 25,
            max_recipients_per_email: 100,
        }
    }
}

/// SMTP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_ssl: bool,
    pub use_tls: bool,
    pub timeout_s: u64,
    pub validate_certificate: bool,
    pub retry_attempts: u32,
    pub max_connections: u32,
    pub pool_idle_minutes: u64,
    pub sender_email: String,
    pub sender_name: String,
    pub default_reply_to: Option<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            username: None,
            password: None,
            use_ssl: false,
            use_tls: true,
            timeout_s: 30,
            validate_certificate: true,
            retry_attempts: 1,
            max_connections: 5,
            pool_idle_minutes: 5,
            sender_email: "noreply@example.com".to_string(),
            sender_name: "Email Worker".to_string(),
            default_reply_to: None,
        }
    }
}

/// Cleanup / archival loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub email_history_retention_days: i64,
    pub processing_log_retention_days: i64,
    pub failed_email_retention_days: i64,
    pub successful_email_retention_days: i64,
    pub service_status_retention_days: i64,
    pub cleanup_interval_hours: i64,
    /// Wall-clock time of day to align cleanup to, "HH:MM" in UTC.
    pub cleanup_time_utc: String,
    pub cleanup_batch_size: u32,
    pub archival: ArchivalConfig,
    pub aggressive_threshold_percent: f64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            email_history_retention_days: 90,
            processing_log_retention_days: 30,
            failed_email_retention_days: 60,
            successful_email_retention_days: 30,
            service_status_retention_days: 14,
            cleanup_interval_hours: 24,
            cleanup_time_utc: "02:00".to_string(),
            cleanup_batch_size: 500,
            archival: ArchivalConfig::default(),
            aggressive_threshold_percent: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchivalConfig {
    pub enabled: bool,
    pub path: String,
    /// "json" or "csv"
    pub format: String,
    pub compress: bool,
    pub max_file_size_mb: u64,
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "./data/archive".to_string(),
            format: "json".to_string(),
            compress: false,
            max_file_size_mb: 100,
        }
    }
}

/// Worker-level configuration: identity, scheduler, health reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub service_name: String,
    pub scheduled_check_interval_minutes: u64,
    pub health_check_interval_minutes: u64,
    pub status_report_email: Option<String>,
    pub alert_email: Option<String>,
    pub webhook_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            service_name: "mw-worker-service".to_string(),
            scheduled_check_interval_minutes: 1,
            health_check_interval_minutes: 5,
            status_report_email: None,
            alert_email: None,
            webhook_url: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration: defaults, overridden by file (if found), overridden by env.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }
}
