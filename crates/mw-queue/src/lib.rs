//! Queue Store + Queue Service.
//!
//! Defines the persistence contract for `QueueItem` rows: atomic claim,
//! finalize (sent/failed), stuck detection/reset, cancellation and
//! aggregate statistics. Concrete backends live in [`sqlite`] and
//! [`postgres`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mw_common::{EmailHistory, ProcessingLog, QueueItem, QueueStatistics, ScheduledEmail, ServiceStatus, Template};
use uuid::Uuid;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub type Result<T> = anyhow::Result<T>;

/// Fields needed to insert a brand new `QueueItem` (ingress submissions and
/// scheduler promotions both go through this).
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub priority: mw_common::Priority,
    pub to_emails: String,
    pub cc_emails: Option<String>,
    pub bcc_emails: Option<String>,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub template_id: Option<i64>,
    pub template_data: Option<serde_json::Value>,
    pub requires_template_processing: bool,
    pub attachments: Option<Vec<mw_common::AttachmentSpec>>,
    pub has_embedded_images: bool,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub is_scheduled: bool,
    pub created_by: Option<String>,
    pub request_source: Option<String>,
}

/// A new `ProcessingLog` row to append. `id`/`created_at` are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewProcessingLog {
    pub log_level: mw_common::LogLevel,
    pub category: String,
    pub message: String,
    pub exception: Option<String>,
    pub queue_id: Option<Uuid>,
    pub worker_id: Option<String>,
    pub processing_step: Option<String>,
    pub context_data: Option<serde_json::Value>,
    pub correlation_id: Option<String>,
    pub machine_name: String,
}

/// Queue Store + Queue Service contract (§4.1).
///
/// Implementations must make `claim_batch` safe against concurrent
/// claimers — a serializable transaction or row-locking equivalent
/// (`SELECT ... FOR UPDATE SKIP LOCKED` on Postgres, a single-writer
/// transaction on SQLite).
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Atomically claim up to `batch_size` eligible `Queued` rows, ordered by
    /// `priority DESC, created_at ASC`, and mark them `Processing`.
    async fn claim_batch(&self, worker_id: &str, batch_size: u32) -> Result<Vec<QueueItem>>;

    /// Transition `Processing -> Sent`. No-op (returns `false`) if the row is
    /// no longer `Processing` or is owned by a different worker.
    #[allow(clippy::too_many_arguments)]
    async fn mark_sent(
        &self,
        queue_id: Uuid,
        worker_id: &str,
        processing_time_ms: i64,
        final_body: &str,
        template_id: Option<i64>,
        template_used: Option<&str>,
        attachment_count: i32,
    ) -> Result<bool>;

    /// Transition on send failure: retry (`Processing -> Queued`,
    /// `retry_count += 1`) if `allow_retry` and under the retry cap, else
    /// terminal `Failed` with an `EmailHistory` row.
    #[allow(clippy::too_many_arguments)]
    async fn mark_failed(
        &self,
        queue_id: Uuid,
        worker_id: &str,
        error_message: &str,
        allow_retry: bool,
        max_retry_attempts: i32,
        retry_delay_minutes: i64,
        final_body: &str,
        attachment_count: i32,
    ) -> Result<()>;

    /// Rows stuck in `Processing` past `threshold_minutes`.
    async fn get_stuck(&self, threshold_minutes: i64, limit: u32) -> Result<Vec<QueueItem>>;

    /// Reset stuck rows to `Queued`, clearing `processed_by`. Returns count reset.
    async fn reset_stuck(&self, threshold_minutes: i64) -> Result<u64>;

    /// Cancel a row from `Queued` or `Processing`. No-op if already terminal.
    async fn cancel(&self, queue_id: Uuid) -> Result<bool>;

    async fn get_queue_statistics(&self) -> Result<QueueStatistics>;

    /// Insert a brand-new row (ingress submissions, scheduler promotions).
    async fn insert_queue_item(&self, item: NewQueueItem) -> Result<Uuid>;

    async fn get_active_template(&self, template_id: i64) -> Result<Option<Template>>;

    /// Rows in `ScheduledEmail` due for promotion right now.
    async fn fetch_due_scheduled(&self, limit: u32) -> Result<Vec<ScheduledEmail>>;

    /// Atomically: enqueue a fresh `QueueItem` from `schedule` and update its
    /// execution bookkeeping (§4.6 fault rule — single transaction per row).
    async fn promote_scheduled(
        &self,
        schedule: &ScheduledEmail,
        next_run_time: Option<DateTime<Utc>>,
        deactivate: bool,
    ) -> Result<Uuid>;

    async fn append_processing_log(&self, log: NewProcessingLog) -> Result<()>;

    async fn upsert_service_status(&self, status: &ServiceStatus) -> Result<()>;

    async fn recent_throughput(&self, service_name: &str, window: chrono::Duration) -> Result<(i64, i64, f64)>;

    /// Delete terminal `QueueItem` rows older than `older_than`, returning the
    /// history rows deleted-alongside count where applicable.
    async fn delete_old_queue_items(&self, status: mw_common::QueueStatus, older_than: DateTime<Utc>, batch_size: u32) -> Result<u64>;

    async fn delete_old_history(&self, older_than: DateTime<Utc>, batch_size: u32) -> Result<u64>;

    async fn delete_old_logs(&self, older_than: DateTime<Utc>, batch_size: u32) -> Result<u64>;

    async fn delete_old_service_status(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// `EmailHistory` rows older than `older_than`, for archival before deletion.
    async fn fetch_history_for_archival(&self, older_than: DateTime<Utc>, batch_size: u32) -> Result<Vec<EmailHistory>>;

    async fn init_schema(&self) -> Result<()>;
}

/// `worker_id` format used for claim ownership and diagnostics (§GLOSSARY).
pub fn worker_id(hostname: &str, task_local_id: u64) -> String {
    format!("{hostname}-{task_local_id}")
}
