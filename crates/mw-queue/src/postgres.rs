//! Postgres-backed Queue Store.
//!
//! Mirrors [`crate::sqlite::SqliteQueueRepository`] but claims rows with
//! `SELECT ... FOR UPDATE SKIP LOCKED` so multiple worker processes sharing
//! one database never block each other on a busy queue.

use crate::{NewProcessingLog, NewQueueItem, QueueRepository, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mw_common::{
    AttachmentSpec, EmailHistory, LogLevel, Priority, QueueItem, QueueStatistics, QueueStatus,
    ScheduledEmail, ServiceStatus, Template,
};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

pub struct PostgresQueueRepository {
    pool: PgPool,
}

impl PostgresQueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn parse_queue_item(row: &sqlx::postgres::PgRow) -> anyhow::Result<QueueItem> {
        let status_code: i16 = row.get("status");
        let priority_code: i16 = row.get("priority");
        let attachments_json: Option<String> = row.try_get("attachments").ok();
        let attachments: Option<Vec<AttachmentSpec>> = attachments_json
            .filter(|s| !s.is_empty())
            .map(|s| serde_json::from_str(&s))
            .transpose()?;
        let template_data: Option<String> = row.try_get("template_data").ok();

        Ok(QueueItem {
            id: row.get("id"),
            queue_id: row.get::<Uuid, _>("queue_id"),
            priority: Priority::from_code(priority_code),
            status: QueueStatus::from_code(status_code)
                .ok_or_else(|| anyhow::anyhow!("unknown status code {status_code}"))?,
            to_emails: row.get("to_emails"),
            cc_emails: row.try_get("cc_emails").ok(),
            bcc_emails: row.try_get("bcc_emails").ok(),
            subject: row.get("subject"),
            body: row.get("body"),
            is_html: row.get("is_html"),
            template_id: row.try_get("template_id").ok(),
            template_data: template_data.map(|s| serde_json::from_str(&s)).transpose()?,
            requires_template_processing: row.get("requires_template_processing"),
            attachments,
            has_embedded_images: row.get("has_embedded_images"),
            retry_count: row.get("retry_count"),
            processing_started_at: row.try_get("processing_started_at").ok(),
            processed_at: row.try_get("processed_at").ok(),
            error_message: row.try_get("error_message").ok(),
            processed_by: row.try_get("processed_by").ok(),
            scheduled_for: row.try_get("scheduled_for").ok(),
            is_scheduled: row.get("is_scheduled"),
            created_at: row.get("created_at"),
            created_by: row.try_get("created_by").ok(),
            updated_at: row.get("updated_at"),
            request_source: row.try_get("request_source").ok(),
        })
    }

    fn parse_scheduled(row: &sqlx::postgres::PgRow) -> anyhow::Result<ScheduledEmail> {
        let template_data: Option<String> = row.try_get("template_data").ok();
        Ok(ScheduledEmail {
            id: row.get("id"),
            schedule_id: row.get::<Uuid, _>("schedule_id"),
            next_run_time: row.get("next_run_time"),
            cron_expression: row.try_get("cron_expression").ok(),
            interval_minutes: row.try_get("interval_minutes").ok(),
            is_recurring: row.get("is_recurring"),
            is_active: row.get("is_active"),
            execution_count: row.get("execution_count"),
            max_executions: row.try_get("max_executions").ok(),
            last_executed_at: row.try_get("last_executed_at").ok(),
            to_emails: row.get("to_emails"),
            cc_emails: row.try_get("cc_emails").ok(),
            bcc_emails: row.try_get("bcc_emails").ok(),
            subject: row.get("subject"),
            body: row.get("body"),
            is_html: row.get("is_html"),
            template_id: row.try_get("template_id").ok(),
            template_data: template_data.map(|s| serde_json::from_str(&s)).transpose()?,
            priority: Priority::from_code(row.get::<i16, _>("priority")),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl QueueRepository for PostgresQueueRepository {
    async fn claim_batch(&self, worker_id: &str, batch_size: u32) -> Result<Vec<QueueItem>> {
        let now = Utc::now();

        let query = r#"
            WITH claimed AS (
                SELECT id FROM email_queue
                WHERE status = 0 AND (is_scheduled = false OR scheduled_for <= $1)
                ORDER BY priority DESC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE email_queue eq
            SET status = 1, processing_started_at = $1, processed_by = $3, updated_at = $1
            FROM claimed
            WHERE eq.id = claimed.id
            RETURNING eq.*
        "#;

        let rows = sqlx::query(query)
            .bind(now)
            .bind(batch_size as i64)
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(Self::parse_queue_item)
            .collect::<anyhow::Result<Vec<_>>>()?;

        debug!(worker_id, count = items.len(), "claimed batch");
        Ok(items)
    }

    async fn mark_sent(
        &self,
        queue_id: Uuid,
        worker_id: &str,
        processing_time_ms: i64,
        final_body: &str,
        template_id: Option<i64>,
        template_used: Option<&str>,
        attachment_count: i32,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE email_queue SET status = 2, processed_at = $1, updated_at = $1 \
             WHERE queue_id = $2 AND status = 1 AND processed_by = $3",
        )
        .bind(now)
        .bind(queue_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let row = sqlx::query(
            "SELECT to_emails, cc_emails, bcc_emails, subject, retry_count FROM email_queue WHERE queue_id = $1",
        )
        .bind(queue_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO email_history \
             (queue_id, to_emails, cc_emails, bcc_emails, subject, final_body, status, sent_at, \
              processing_time_ms, retry_count, template_id, template_used, attachment_count, error_details, processed_by) \
             VALUES ($1, $2, $3, $4, $5, $6, 2, $7, $8, $9, $10, $11, $12, NULL, $13)",
        )
        .bind(queue_id)
        .bind(row.get::<String, _>("to_emails"))
        .bind(row.try_get::<Option<String>, _>("cc_emails").ok().flatten())
        .bind(row.try_get::<Option<String>, _>("bcc_emails").ok().flatten())
        .bind(row.get::<String, _>("subject"))
        .bind(final_body)
        .bind(now)
        .bind(processing_time_ms)
        .bind(row.get::<i32, _>("retry_count"))
        .bind(template_id)
        .bind(template_used)
        .bind(attachment_count)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(queue_id = %queue_id, worker_id, "marked sent");
        Ok(true)
    }

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
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT to_emails, cc_emails, bcc_emails, subject, retry_count, template_id FROM email_queue WHERE queue_id = $1",
        )
        .bind(queue_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(());
        };

        let retry_count: i32 = row.get("retry_count");

        if allow_retry && retry_count < max_retry_attempts {
            let eligible_at = now + chrono::Duration::minutes(retry_delay_minutes);
            sqlx::query(
                "UPDATE email_queue SET status = 0, retry_count = retry_count + 1, \
                 processing_started_at = NULL, processed_by = NULL, error_message = $1, \
                 scheduled_for = $2, is_scheduled = true, updated_at = $3 \
                 WHERE queue_id = $4 AND status = 1 AND processed_by = $5",
            )
            .bind(error_message)
            .bind(eligible_at)
            .bind(now)
            .bind(queue_id)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;
        } else {
            let updated = sqlx::query(
                "UPDATE email_queue SET status = 3, processed_at = $1, error_message = $2, updated_at = $1 \
                 WHERE queue_id = $3 AND status = 1 AND processed_by = $4",
            )
            .bind(now)
            .bind(error_message)
            .bind(queue_id)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated > 0 {
                sqlx::query(
                    "INSERT INTO email_history \
                     (queue_id, to_emails, cc_emails, bcc_emails, subject, final_body, status, sent_at, \
                      processing_time_ms, retry_count, template_id, template_used, attachment_count, error_details, processed_by) \
                     VALUES ($1, $2, $3, $4, $5, $6, 3, $7, 0, $8, $9, NULL, $10, $11, $12)",
                )
                .bind(queue_id)
                .bind(row.get::<String, _>("to_emails"))
                .bind(row.try_get::<Option<String>, _>("cc_emails").ok().flatten())
                .bind(row.try_get::<Option<String>, _>("bcc_emails").ok().flatten())
                .bind(row.get::<String, _>("subject"))
                .bind(final_body)
                .bind(now)
                .bind(retry_count)
                .bind(row.try_get::<Option<i64>, _>("template_id").ok().flatten())
                .bind(attachment_count)
                .bind(error_message)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_stuck(&self, threshold_minutes: i64, limit: u32) -> Result<Vec<QueueItem>> {
        let cutoff = Utc::now() - chrono::Duration::minutes(threshold_minutes);
        let rows = sqlx::query(
            "SELECT * FROM email_queue WHERE status = 1 AND processing_started_at < $1 \
             ORDER BY processing_started_at ASC LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_queue_item).collect()
    }

    async fn reset_stuck(&self, threshold_minutes: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::minutes(threshold_minutes);
        let now = Utc::now();

        let affected = sqlx::query(
            "UPDATE email_queue SET status = 0, processed_by = NULL, processing_started_at = NULL, updated_at = $1 \
             WHERE status = 1 AND processing_started_at < $2",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected > 0 {
            info!(count = affected, "reset stuck items to queued");
        }
        Ok(affected)
    }

    async fn cancel(&self, queue_id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let affected = sqlx::query(
            "UPDATE email_queue SET status = 4, updated_at = $1 WHERE queue_id = $2 AND status IN (0, 1)",
        )
        .bind(now)
        .bind(queue_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn get_queue_statistics(&self) -> Result<QueueStatistics> {
        let row = sqlx::query(
            "SELECT \
                SUM(CASE WHEN status = 0 THEN 1 ELSE 0 END) AS queued, \
                SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END) AS processing, \
                SUM(CASE WHEN status = 2 THEN 1 ELSE 0 END) AS sent, \
                SUM(CASE WHEN status = 3 THEN 1 ELSE 0 END) AS failed, \
                SUM(CASE WHEN status = 4 THEN 1 ELSE 0 END) AS cancelled, \
                SUM(CASE WHEN status = 5 THEN 1 ELSE 0 END) AS scheduled, \
                MIN(CASE WHEN status = 0 THEN created_at END) AS oldest_queued \
             FROM email_queue",
        )
        .fetch_one(&self.pool)
        .await?;

        let now = Utc::now();
        let oldest_queued: Option<DateTime<Utc>> = row.try_get("oldest_queued").ok().flatten();

        let avg_row = sqlx::query("SELECT AVG(processing_time_ms) AS avg_ms FROM email_history WHERE status = 2")
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueStatistics {
            queued: row.try_get::<Option<i64>, _>("queued").ok().flatten().unwrap_or(0),
            processing: row.try_get::<Option<i64>, _>("processing").ok().flatten().unwrap_or(0),
            sent: row.try_get::<Option<i64>, _>("sent").ok().flatten().unwrap_or(0),
            failed: row.try_get::<Option<i64>, _>("failed").ok().flatten().unwrap_or(0),
            cancelled: row.try_get::<Option<i64>, _>("cancelled").ok().flatten().unwrap_or(0),
            scheduled: row.try_get::<Option<i64>, _>("scheduled").ok().flatten().unwrap_or(0),
            oldest_queued_age_seconds: oldest_queued.map(|ts| (now - ts).num_seconds()),
            avg_processing_time_ms: avg_row.try_get::<Option<f64>, _>("avg_ms").ok().flatten(),
        })
    }

    async fn insert_queue_item(&self, item: NewQueueItem) -> Result<Uuid> {
        let queue_id = Uuid::new_v4();
        let now = Utc::now();
        let attachments_json = item
            .attachments
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let template_data_json = item.template_data.as_ref().map(serde_json::to_string).transpose()?;
        let status: i16 = if item.is_scheduled { QueueStatus::Scheduled.code() } else { QueueStatus::Queued.code() };

        sqlx::query(
            "INSERT INTO email_queue \
             (queue_id, priority, status, to_emails, cc_emails, bcc_emails, subject, body, is_html, \
              template_id, template_data, requires_template_processing, attachments, has_embedded_images, \
              retry_count, scheduled_for, is_scheduled, created_at, created_by, updated_at, request_source) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 0, $15, $16, $17, $18, $17, $19)",
        )
        .bind(queue_id)
        .bind(item.priority.code())
        .bind(status)
        .bind(&item.to_emails)
        .bind(&item.cc_emails)
        .bind(&item.bcc_emails)
        .bind(&item.subject)
        .bind(&item.body)
        .bind(item.is_html)
        .bind(item.template_id)
        .bind(template_data_json)
        .bind(item.requires_template_processing)
        .bind(attachments_json)
        .bind(item.has_embedded_images)
        .bind(item.scheduled_for)
        .bind(item.is_scheduled)
        .bind(now)
        .bind(&item.created_by)
        .bind(&item.request_source)
        .execute(&self.pool)
        .await?;

        Ok(queue_id)
    }

    async fn get_active_template(&self, template_id: i64) -> Result<Option<Template>> {
        let row = sqlx::query(
            "SELECT id, name, category, subject_template, body_template, is_active, version, created_at, updated_at \
             FROM email_templates WHERE id = $1 AND is_active = true",
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Template {
            id: row.get("id"),
            name: row.get("name"),
            category: row.try_get("category").ok(),
            subject_template: row.get("subject_template"),
            body_template: row.get("body_template"),
            is_active: row.get("is_active"),
            version: row.get("version"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn fetch_due_scheduled(&self, limit: u32) -> Result<Vec<ScheduledEmail>> {
        let now = Utc::now();
        let rows = sqlx::query(
            "SELECT * FROM scheduled_emails \
             WHERE is_active = true AND next_run_time <= $1 \
             AND (max_executions IS NULL OR execution_count < max_executions) \
             ORDER BY next_run_time ASC LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_scheduled).collect()
    }

    async fn promote_scheduled(
        &self,
        schedule: &ScheduledEmail,
        next_run_time: Option<DateTime<Utc>>,
        deactivate: bool,
    ) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;
        let queue_id = Uuid::new_v4();
        let now = Utc::now();
        let template_data_json = schedule.template_data.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            "INSERT INTO email_queue \
             (queue_id, priority, status, to_emails, cc_emails, bcc_emails, subject, body, is_html, \
              template_id, template_data, requires_template_processing, has_embedded_images, retry_count, \
              is_scheduled, created_at, created_by, updated_at, request_source) \
             VALUES ($1, $2, 0, $3, $4, $5, $6, $7, $8, $9, $10, $11, false, 0, false, $12, 'scheduler', $12, 'scheduler')",
        )
        .bind(queue_id)
        .bind(schedule.priority.code())
        .bind(&schedule.to_emails)
        .bind(&schedule.cc_emails)
        .bind(&schedule.bcc_emails)
        .bind(&schedule.subject)
        .bind(&schedule.body)
        .bind(schedule.is_html)
        .bind(schedule.template_id)
        .bind(template_data_json)
        .bind(schedule.template_id.is_some())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if deactivate {
            sqlx::query(
                "UPDATE scheduled_emails SET is_active = false, execution_count = execution_count + 1, last_executed_at = $1 \
                 WHERE schedule_id = $2",
            )
            .bind(now)
            .bind(schedule.schedule_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE scheduled_emails SET execution_count = execution_count + 1, last_executed_at = $1, next_run_time = $2 \
                 WHERE schedule_id = $3",
            )
            .bind(now)
            .bind(next_run_time.unwrap_or(now))
            .bind(schedule.schedule_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(queue_id)
    }

    async fn append_processing_log(&self, log: NewProcessingLog) -> Result<()> {
        let now = Utc::now();
        let level_code: i16 = match log.log_level {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warning => 2,
            LogLevel::Error => 3,
        };
        let context_json = log.context_data.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            "INSERT INTO processing_logs \
             (log_level, category, message, exception, queue_id, worker_id, processing_step, context_data, correlation_id, machine_name, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(level_code)
        .bind(&log.category)
        .bind(&log.message)
        .bind(&log.exception)
        .bind(log.queue_id)
        .bind(&log.worker_id)
        .bind(&log.processing_step)
        .bind(context_json)
        .bind(&log.correlation_id)
        .bind(&log.machine_name)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_service_status(&self, status: &ServiceStatus) -> Result<()> {
        sqlx::query(
            "INSERT INTO service_status \
             (service_name, machine_name, status, last_heartbeat, queue_depth, emails_per_hour, error_rate, \
              avg_processing_ms, cpu_percent, memory_mb, uptime_seconds, total_processed, total_failed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (service_name, machine_name) DO UPDATE SET \
               status = excluded.status, last_heartbeat = excluded.last_heartbeat, \
               queue_depth = excluded.queue_depth, emails_per_hour = excluded.emails_per_hour, \
               error_rate = excluded.error_rate, avg_processing_ms = excluded.avg_processing_ms, \
               cpu_percent = excluded.cpu_percent, memory_mb = excluded.memory_mb, \
               uptime_seconds = excluded.uptime_seconds, total_processed = excluded.total_processed, \
               total_failed = excluded.total_failed",
        )
        .bind(&status.service_name)
        .bind(&status.machine_name)
        .bind(&status.status)
        .bind(status.last_heartbeat)
        .bind(status.queue_depth)
        .bind(status.emails_per_hour)
        .bind(status.error_rate)
        .bind(status.avg_processing_ms)
        .bind(status.cpu_percent)
        .bind(status.memory_mb)
        .bind(status.uptime_seconds)
        .bind(status.total_processed)
        .bind(status.total_failed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_throughput(&self, _service_name: &str, window: chrono::Duration) -> Result<(i64, i64, f64)> {
        let cutoff = Utc::now() - window;
        let row = sqlx::query(
            "SELECT \
                SUM(CASE WHEN status = 2 THEN 1 ELSE 0 END) AS processed, \
                SUM(CASE WHEN status = 3 THEN 1 ELSE 0 END) AS failed, \
                AVG(processing_time_ms) AS avg_ms \
             FROM email_history WHERE sent_at >= $1",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok((
            row.try_get::<Option<i64>, _>("processed").ok().flatten().unwrap_or(0),
            row.try_get::<Option<i64>, _>("failed").ok().flatten().unwrap_or(0),
            row.try_get::<Option<f64>, _>("avg_ms").ok().flatten().unwrap_or(0.0),
        ))
    }

    async fn delete_old_queue_items(&self, status: QueueStatus, older_than: DateTime<Utc>, batch_size: u32) -> Result<u64> {
        let affected = sqlx::query(
            "DELETE FROM email_queue WHERE id IN (\
                SELECT id FROM email_queue WHERE status = $1 AND updated_at < $2 LIMIT $3\
             )",
        )
        .bind(status.code())
        .bind(older_than)
        .bind(batch_size as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    async fn delete_old_history(&self, older_than: DateTime<Utc>, batch_size: u32) -> Result<u64> {
        let affected = sqlx::query(
            "DELETE FROM email_history WHERE id IN (\
                SELECT id FROM email_history WHERE sent_at < $1 LIMIT $2\
             )",
        )
        .bind(older_than)
        .bind(batch_size as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    async fn delete_old_logs(&self, older_than: DateTime<Utc>, batch_size: u32) -> Result<u64> {
        let affected = sqlx::query(
            "DELETE FROM processing_logs WHERE id IN (\
                SELECT id FROM processing_logs WHERE created_at < $1 LIMIT $2\
             )",
        )
        .bind(older_than)
        .bind(batch_size as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    async fn delete_old_service_status(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM service_status WHERE last_heartbeat < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    async fn fetch_history_for_archival(&self, older_than: DateTime<Utc>, batch_size: u32) -> Result<Vec<EmailHistory>> {
        let rows = sqlx::query("SELECT * FROM email_history WHERE sent_at < $1 ORDER BY sent_at ASC LIMIT $2")
            .bind(older_than)
            .bind(batch_size as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok::<_, anyhow::Error>(EmailHistory {
                    id: row.get("id"),
                    queue_id: row.get::<Uuid, _>("queue_id"),
                    to_emails: row.get("to_emails"),
                    cc_emails: row.try_get("cc_emails").ok(),
                    bcc_emails: row.try_get("bcc_emails").ok(),
                    subject: row.get("subject"),
                    final_body: row.get("final_body"),
                    status: QueueStatus::from_code(row.get::<i16, _>("status"))
                        .ok_or_else(|| anyhow::anyhow!("unknown status"))?,
                    sent_at: row.get("sent_at"),
                    processing_time_ms: row.get("processing_time_ms"),
                    retry_count: row.get("retry_count"),
                    template_id: row.try_get("template_id").ok(),
                    template_used: row.try_get("template_used").ok(),
                    attachment_count: row.get("attachment_count"),
                    error_details: row.try_get("error_details").ok(),
                    processed_by: row.try_get("processed_by").ok(),
                })
            })
            .collect()
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS email_queue (
                id BIGSERIAL PRIMARY KEY,
                queue_id UUID UNIQUE NOT NULL,
                priority SMALLINT NOT NULL DEFAULT 2,
                status SMALLINT NOT NULL DEFAULT 0,
                to_emails TEXT NOT NULL,
                cc_emails TEXT,
                bcc_emails TEXT,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                is_html BOOLEAN NOT NULL DEFAULT false,
                template_id BIGINT,
                template_data TEXT,
                requires_template_processing BOOLEAN NOT NULL DEFAULT false,
                attachments TEXT,
                has_embedded_images BOOLEAN NOT NULL DEFAULT false,
                retry_count INTEGER NOT NULL DEFAULT 0,
                processing_started_at TIMESTAMPTZ,
                processed_at TIMESTAMPTZ,
                error_message TEXT,
                processed_by TEXT,
                scheduled_for TIMESTAMPTZ,
                is_scheduled BOOLEAN NOT NULL DEFAULT false,
                created_at TIMESTAMPTZ NOT NULL,
                created_by TEXT,
                updated_at TIMESTAMPTZ NOT NULL,
                request_source TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_email_queue_claim ON email_queue(status, priority, created_at);
            CREATE INDEX IF NOT EXISTS idx_email_queue_scheduled ON email_queue(scheduled_for) WHERE is_scheduled;
            CREATE INDEX IF NOT EXISTS idx_email_queue_failed_retry ON email_queue(retry_count) WHERE status = 3;

            CREATE TABLE IF NOT EXISTS email_templates (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                category TEXT,
                subject_template TEXT NOT NULL,
                body_template TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT true,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_email_templates_active_name
                ON email_templates(name) WHERE is_active;

            CREATE TABLE IF NOT EXISTS email_history (
                id BIGSERIAL PRIMARY KEY,
                queue_id UUID NOT NULL,
                to_emails TEXT NOT NULL,
                cc_emails TEXT,
                bcc_emails TEXT,
                subject TEXT NOT NULL,
                final_body TEXT NOT NULL,
                status SMALLINT NOT NULL,
                sent_at TIMESTAMPTZ NOT NULL,
                processing_time_ms BIGINT NOT NULL,
                retry_count INTEGER NOT NULL,
                template_id BIGINT,
                template_used TEXT,
                attachment_count INTEGER NOT NULL DEFAULT 0,
                error_details TEXT,
                processed_by TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_email_history_sent_at ON email_history(sent_at);
            CREATE INDEX IF NOT EXISTS idx_email_history_queue_id ON email_history(queue_id);

            CREATE TABLE IF NOT EXISTS processing_logs (
                id BIGSERIAL PRIMARY KEY,
                log_level SMALLINT NOT NULL,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                exception TEXT,
                queue_id UUID,
                worker_id TEXT,
                processing_step TEXT,
                context_data TEXT,
                correlation_id TEXT,
                machine_name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processing_logs_created_at ON processing_logs(created_at);
            CREATE INDEX IF NOT EXISTS idx_processing_logs_queue_id ON processing_logs(queue_id);

            CREATE TABLE IF NOT EXISTS scheduled_emails (
                id BIGSERIAL PRIMARY KEY,
                schedule_id UUID UNIQUE NOT NULL,
                next_run_time TIMESTAMPTZ NOT NULL,
                cron_expression TEXT,
                interval_minutes INTEGER,
                is_recurring BOOLEAN NOT NULL DEFAULT false,
                is_active BOOLEAN NOT NULL DEFAULT true,
                execution_count INTEGER NOT NULL DEFAULT 0,
                max_executions INTEGER,
                last_executed_at TIMESTAMPTZ,
                to_emails TEXT NOT NULL,
                cc_emails TEXT,
                bcc_emails TEXT,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                is_html BOOLEAN NOT NULL DEFAULT false,
                template_id BIGINT,
                template_data TEXT,
                priority SMALLINT NOT NULL DEFAULT 2,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_emails_due ON scheduled_emails(next_run_time) WHERE is_active;

            CREATE TABLE IF NOT EXISTS service_status (
                service_name TEXT NOT NULL,
                machine_name TEXT NOT NULL,
                status TEXT NOT NULL,
                last_heartbeat TIMESTAMPTZ NOT NULL,
                queue_depth BIGINT NOT NULL DEFAULT 0,
                emails_per_hour DOUBLE PRECISION NOT NULL DEFAULT 0,
                error_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
                avg_processing_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
                cpu_percent DOUBLE PRECISION,
                memory_mb DOUBLE PRECISION,
                uptime_seconds BIGINT NOT NULL DEFAULT 0,
                total_processed BIGINT NOT NULL DEFAULT 0,
                total_failed BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (service_name, machine_name)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("initialized postgres queue store schema");
        Ok(())
    }
}
