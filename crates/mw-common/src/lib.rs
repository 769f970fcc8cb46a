use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod logging;

// ============================================================================
// Status & priority codes (wire-fixed, see EXTERNAL INTERFACES)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Queued,
    Processing,
    Sent,
    Failed,
    Cancelled,
    Scheduled,
}

impl QueueStatus {
    pub fn code(&self) -> i16 {
        match self {
            QueueStatus::Queued => 0,
            QueueStatus::Processing => 1,
            QueueStatus::Sent => 2,
            QueueStatus::Failed => 3,
            QueueStatus::Cancelled => 4,
            QueueStatus::Scheduled => 5,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(QueueStatus::Queued),
            1 => Some(QueueStatus::Processing),
            2 => Some(QueueStatus::Sent),
            3 => Some(QueueStatus::Failed),
            4 => Some(QueueStatus::Cancelled),
            5 => Some(QueueStatus::Scheduled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Sent | QueueStatus::Failed | QueueStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn code(&self) -> i16 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }

    pub fn from_code(code: i16) -> Self {
        match code {
            1 => Priority::Low,
            3 => Priority::High,
            4 => Priority::Critical,
            _ => Priority::Normal,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

// ============================================================================
// Attachments
// ============================================================================

/// One entry of a QueueItem's JSON-serialized attachment list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentSpec {
    pub file_name: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub is_inline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
}

// ============================================================================
// QueueItem
// ============================================================================

/// Durable unit of work: one email send request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub queue_id: Uuid,
    pub priority: Priority,
    pub status: QueueStatus,
    pub to_emails: String,
    pub cc_emails: Option<String>,
    pub bcc_emails: Option<String>,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub template_id: Option<i64>,
    pub template_data: Option<serde_json::Value>,
    pub requires_template_processing: bool,
    pub attachments: Option<Vec<AttachmentSpec>>,
    pub has_embedded_images: bool,
    pub retry_count: i32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub processed_by: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub is_scheduled: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub request_source: Option<String>,
}

// ============================================================================
// Template
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub category: Option<String>,
    pub subject_template: String,
    pub body_template: String,
    pub is_active: bool,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// EmailHistory
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailHistory {
    pub id: i64,
    pub queue_id: Uuid,
    pub to_emails: String,
    pub cc_emails: Option<String>,
    pub bcc_emails: Option<String>,
    pub subject: String,
    pub final_body: String,
    pub status: QueueStatus,
    pub sent_at: DateTime<Utc>,
    pub processing_time_ms: i64,
    pub retry_count: i32,
    pub template_id: Option<i64>,
    pub template_used: Option<String>,
    pub attachment_count: i32,
    pub error_details: Option<String>,
    pub processed_by: Option<String>,
}

// ============================================================================
// ProcessingLog
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLog {
    pub id: i64,
    pub log_level: LogLevel,
    pub category: String,
    pub message: String,
    pub exception: Option<String>,
    pub queue_id: Option<Uuid>,
    pub worker_id: Option<String>,
    pub processing_step: Option<String>,
    pub context_data: Option<serde_json::Value>,
    pub correlation_id: Option<String>,
    pub machine_name: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// ScheduledEmail
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEmail {
    pub id: i64,
    pub schedule_id: Uuid,
    pub next_run_time: DateTime<Utc>,
    pub cron_expression: Option<String>,
    pub interval_minutes: Option<i32>,
    pub is_recurring: bool,
    pub is_active: bool,
    pub execution_count: i32,
    pub max_executions: Option<i32>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub to_emails: String,
    pub cc_emails: Option<String>,
    pub bcc_emails: Option<String>,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub template_id: Option<i64>,
    pub template_data: Option<serde_json::Value>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// ServiceStatus
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service_name: String,
    pub machine_name: String,
    pub status: String,
    pub last_heartbeat: DateTime<Utc>,
    pub queue_depth: i64,
    pub emails_per_hour: f64,
    pub error_rate: f64,
    pub avg_processing_ms: f64,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
    pub uptime_seconds: i64,
    pub total_processed: i64,
    pub total_failed: i64,
}

// ============================================================================
// Queue statistics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueStatistics {
    pub queued: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub scheduled: i64,
    pub oldest_queued_age_seconds: Option<i64>,
    pub avg_processing_time_ms: Option<f64>,
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }
}

// ============================================================================
// Error kinds (§7 ERROR HANDLING DESIGN)
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient transport error: {0}")]
    TransientTransport(String),

    #[error("permanent transport error: {0}")]
    PermanentTransport(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("fatal startup error: {0}")]
    FatalStartup(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Tagged outcome of running the Processing Pipeline on one item.
/// Favors a concrete enum over exception-based control flow (§9).
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Sent { processing_time_ms: i64 },
    TransientErr { message: String },
    PermanentErr { message: String },
    ValidationErr { message: String },
}

impl PipelineOutcome {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineOutcome::TransientErr { .. })
    }
}
