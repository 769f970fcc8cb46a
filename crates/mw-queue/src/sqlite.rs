//! SQLite-backed Queue Store.
//!
//! Timestamps are stored as epoch milliseconds (UTC), matching this
//! codebase's existing SQLite outbox convention. All mutation happens
//! through single atomic statements — SQLite's single-writer model makes a
//! separate serializable transaction unnecessary for `claim_batch`.

use crate::{NewProcessingLog, NewQueueItem, QueueRepository, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mw_common::{
    AttachmentSpec, EmailHistory, LogLevel, Priority, ProcessingLog, QueueItem, QueueStatistics,
    QueueStatus, ScheduledEmail, ServiceStatus, Template,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

pub struct SqliteQueueRepository {
    pool: SqlitePool,
}

impl SqliteQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn parse_queue_item(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<QueueItem> {
        let status_code: i64 = row.get("status");
        let priority_code: i64 = row.get("priority");
        let attachments_json: Option<String> = row.try_get("attachments").ok();
        let attachments: Option<Vec<AttachmentSpec>> = attachments_json
            .filter(|s| !s.is_empty())
            .map(|s| serde_json::from_str(&s))
            .transpose()?;
        let template_data: Option<String> = row.try_get("template_data").ok();

        Ok(QueueItem {
            id: row.get("id"),
            queue_id: Uuid::parse_str(row.get("queue_id"))?,
            priority: Priority::from_code(priority_code as i16),
            status: QueueStatus::from_code(status_code as i16)
                .ok_or_else(|| anyhow::anyhow!("unknown status code {status_code}"))?,
            to_emails: row.get("to_emails"),
            cc_emails: row.try_get("cc_emails").ok(),
            bcc_emails: row.try_get("bcc_emails").ok(),
            subject: row.get("subject"),
            body: row.get("body"),
            is_html: row.get::<i64, _>("is_html") != 0,
            template_id: row.try_get("template_id").ok(),
            template_data: template_data.map(|s| serde_json::from_str(&s)).transpose()?,
            requires_template_processing: row.get::<i64, _>("requires_template_processing") != 0,
            attachments,
            has_embedded_images: row.get::<i64, _>("has_embedded_images") != 0,
            retry_count: row.get::<i64, _>("retry_count") as i32,
            processing_started_at: millis_to_dt(row.try_get("processing_started_at").ok()),
            processed_at: millis_to_dt(row.try_get("processed_at").ok()),
            error_message: row.try_get("error_message").ok(),
            processed_by: row.try_get("processed_by").ok(),
            scheduled_for: millis_to_dt(row.try_get("scheduled_for").ok()),
            is_scheduled: row.get::<i64, _>("is_scheduled") != 0,
            created_at: millis_to_dt(Some(row.get("created_at"))).unwrap(),
            created_by: row.try_get("created_by").ok(),
            updated_at: millis_to_dt(Some(row.get("updated_at"))).unwrap(),
            request_source: row.try_get("request_source").ok(),
        })
    }

    fn parse_scheduled(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<ScheduledEmail> {
        let template_data: Option<String> = row.try_get("template_data").ok();
        Ok(ScheduledEmail {
            id: row.get("id"),
            schedule_id: Uuid::parse_str(row.get("schedule_id"))?,
            next_run_time: millis_to_dt(Some(row.get("next_run_time"))).unwrap(),
            cron_expression: row.try_get("cron_expression").ok(),
            interval_minutes: row.try_get("interval_minutes").ok(),
            is_recurring: row.get::<i64, _>("is_recurring") != 0,
            is_active: row.get::<i64, _>("is_active") != 0,
            execution_count: row.get::<i64, _>("execution_count") as i32,
            max_executions: row.try_get("max_executions").ok(),
            last_executed_at: millis_to_dt(row.try_get("last_executed_at").ok()),
            to_emails: row.get("to_emails"),
            cc_emails: row.try_get("cc_emails").ok(),
            bcc_emails: row.try_get("bcc_emails").ok(),
            subject: row.get("subject"),
            body: row.get("body"),
            is_html: row.get::<i64, _>("is_html") != 0,
            template_id: row.try_get("template_id").ok(),
            template_data: template_data.map(|s| serde_json::from_str(&s)).transpose()?,
            priority: Priority::from_code(row.get::<i64, _>("priority") as i16),
            created_at: millis_to_dt(Some(row.get("created_at"))).unwrap(),
        })
    }
}

fn millis_to_dt(v: Option<i64>) -> Option<DateTime<Utc>> {
    v.and_then(DateTime::from_timestamp_millis)
}

#[async_trait]
impl QueueRepository for SqliteQueueRepository {
    async fn claim_batch(&self, worker_id: &str, batch_size: u32) -> Result<Vec<QueueItem>> {
        let now = Utc::now().timestamp_millis();

        let query = r#"
            UPDATE email_queue
            SET status = 1, processing_started_at = ?, processed_by = ?, updated_at = ?
            WHERE id IN (
                SELECT id FROM email_queue
                WHERE status = 0 AND (is_scheduled = 0 OR scheduled_for <= ?)
                ORDER BY priority DESC, created_at ASC
                LIMIT ?
            )
            RETURNING *
        "#;

        let rows = sqlx::query(query)
            .bind(now)
            .bind(worker_id)
            .bind(now)
            .bind(now)
            .bind(batch_size)
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
        let now = Utc::now().timestamp_millis();
        let id_str = queue_id.to_string();

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE email_queue SET status = 2, processed_at = ?, updated_at = ? \
             WHERE queue_id = ? AND status = 1 AND processed_by = ?",
        )
        .bind(now)
        .bind(now)
        .bind(&id_str)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let row = sqlx::query("SELECT to_emails, cc_emails, bcc_emails, subject, retry_count FROM email_queue WHERE queue_id = ?")
            .bind(&id_str)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO email_history \
             (queue_id, to_emails, cc_emails, bcc_emails, subject, final_body, status, sent_at, \
              processing_time_ms, retry_count, template_id, template_used, attachment_count, error_details, processed_by) \
             VALUES (?, ?, ?, ?, ?, ?, 2, ?, ?, ?, ?, ?, ?, NULL, ?)",
        )
        .bind(&id_str)
        .bind(row.get::<String, _>("to_emails"))
        .bind(row.try_get::<Option<String>, _>("cc_emails").ok().flatten())
        .bind(row.try_get::<Option<String>, _>("bcc_emails").ok().flatten())
        .bind(row.get::<String, _>("subject"))
        .bind(final_body)
        .bind(now)
        .bind(processing_time_ms)
        .bind(row.get::<i64, _>("retry_count"))
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
        let now_dt = Utc::now();
        let now = now_dt.timestamp_millis();
        let id_str = queue_id.to_string();

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT to_emails, cc_emails, bcc_emails, subject, retry_count, template_id FROM email_queue WHERE queue_id = ?",
        )
        .bind(&id_str)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(());
        };

        let retry_count: i64 = row.get("retry_count");

        if allow_retry && retry_count < max_retry_attempts as i64 {
            let eligible_at = now_dt + chrono::Duration::minutes(retry_delay_minutes);
            sqlx::query(
                "UPDATE email_queue SET status = 0, retry_count = retry_count + 1, \
                 processing_started_at = NULL, processed_by = NULL, error_message = ?, \
                 scheduled_for = ?, is_scheduled = 1, updated_at = ? \
                 WHERE queue_id = ? AND status = 1 AND processed_by = ?",
            )
            .bind(error_message)
            .bind(eligible_at.timestamp_millis())
            .bind(now)
            .bind(&id_str)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;
        } else {
            let updated = sqlx::query(
                "UPDATE email_queue SET status = 3, processed_at = ?, error_message = ?, updated_at = ? \
                 WHERE queue_id = ? AND status = 1 AND processed_by = ?",
            )
            .bind(now)
            .bind(error_message)
            .bind(now)
            .bind(&id_str)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated > 0 {
                sqlx::query(
                    "INSERT INTO email_history \
                     (queue_id, to_emails, cc_emails, bcc_emails, subject, final_body, status, sent_at, \
                      processing_time_ms, retry_count, template_id, template_used, attachment_count, error_details, processed_by) \
                     VALUES (?, ?, ?, ?, ?, ?, 3, ?, 0, ?, ?, NULL, ?, ?, ?)",
                )
                .bind(&id_str)
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
        let cutoff = (Utc::now() - chrono::Duration::minutes(threshold_minutes)).timestamp_millis();
        let rows = sqlx::query(
            "SELECT * FROM email_queue WHERE status = 1 AND processing_started_at < ? \
             ORDER BY processing_started_at ASC LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_queue_item).collect()
    }

    async fn reset_stuck(&self, threshold_minutes: i64) -> Result<u64> {
        let cutoff = (Utc::now() - chrono::Duration::minutes(threshold_minutes)).timestamp_millis();
        let now = Utc::now().timestamp_millis();

        let affected = sqlx::query(
            "UPDATE email_queue SET status = 0, processed_by = NULL, processing_started_at = NULL, updated_at = ? \
             WHERE status = 1 AND processing_started_at < ?",
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
        let now = Utc::now().timestamp_millis();
        let affected = sqlx::query(
            "UPDATE email_queue SET status = 4, updated_at = ? WHERE queue_id = ? AND status IN (0, 1)",
        )
        .bind(now)
        .bind(queue_id.to_string())
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

        let now = Utc::now().timestamp_millis();
        let oldest_queued: Option<i64> = row.try_get("oldest_queued").ok().flatten();

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
            oldest_queued_age_seconds: oldest_queued.map(|ts| (now - ts) / 1000),
            avg_processing_time_ms: avg_row.try_get::<Option<f64>, _>("avg_ms").ok().flatten(),
        })
    }

    async fn insert_queue_item(&self, item: NewQueueItem) -> Result<Uuid> {
        let queue_id = Uuid::new_v4();
        let now = Utc::now().timestamp_millis();
        let attachments_json = item
            .attachments
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let template_data_json = item.template_data.as_ref().map(serde_json::to_string).transpose()?;
        let status = if item.is_scheduled { QueueStatus::Scheduled.code() } else { QueueStatus::Queued.code() };

        sqlx::query(
            "INSERT INTO email_queue \
             (queue_id, priority, status, to_emails, cc_emails, bcc_emails, subject, body, is_html, \
              template_id, template_data, requires_template_processing, attachments, has_embedded_images, \
              retry_count, scheduled_for, is_scheduled, created_at, created_by, updated_at, request_source) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)",
        )
        .bind(queue_id.to_string())
        .bind(item.priority.code())
        .bind(status)
        .bind(&item.to_emails)
        .bind(&item.cc_emails)
        .bind(&item.bcc_emails)
        .bind(&item.subject)
        .bind(&item.body)
        .bind(item.is_html as i64)
        .bind(item.template_id)
        .bind(template_data_json)
        .bind(item.requires_template_processing as i64)
        .bind(attachments_json)
        .bind(item.has_embedded_images as i64)
        .bind(item.scheduled_for.map(|d| d.timestamp_millis()))
        .bind(item.is_scheduled as i64)
        .bind(now)
        .bind(&item.created_by)
        .bind(now)
        .bind(&item.request_source)
        .execute(&self.pool)
        .await?;

        Ok(queue_id)
    }

    async fn get_active_template(&self, template_id: i64) -> Result<Option<Template>> {
        let row = sqlx::query(
            "SELECT id, name, category, subject_template, body_template, is_active, version, created_at, updated_at \
             FROM email_templates WHERE id = ? AND is_active = 1",
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok::<_, anyhow::Error>(Template {
                id: row.get("id"),
                name: row.get("name"),
                category: row.try_get("category").ok(),
                subject_template: row.get("subject_template"),
                body_template: row.get("body_template"),
                is_active: row.get::<i64, _>("is_active") != 0,
                version: row.get::<i64, _>("version") as i32,
                created_at: millis_to_dt(Some(row.get("created_at"))).unwrap(),
                updated_at: millis_to_dt(Some(row.get("updated_at"))).unwrap(),
            })
        })
        .transpose()
    }

    async fn fetch_due_scheduled(&self, limit: u32) -> Result<Vec<ScheduledEmail>> {
        let now = Utc::now().timestamp_millis();
        let rows = sqlx::query(
            "SELECT * FROM scheduled_emails \
             WHERE is_active = 1 AND next_run_time <= ? \
             AND (max_executions IS NULL OR execution_count < max_executions) \
             ORDER BY next_run_time ASC LIMIT ?",
        )
        .bind(now)
        .bind(limit)
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
        let now = Utc::now().timestamp_millis();
        let template_data_json = schedule.template_data.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            "INSERT INTO email_queue \
             (queue_id, priority, status, to_emails, cc_emails, bcc_emails, subject, body, is_html, \
              template_id, template_data, requires_template_processing, has_embedded_images, retry_count, \
              is_scheduled, created_at, created_by, updated_at, request_source) \
             VALUES (?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, ?, 'scheduler', ?, 'scheduler')",
        )
        .bind(queue_id.to_string())
        .bind(schedule.priority.code())
        .bind(&schedule.to_emails)
        .bind(&schedule.cc_emails)
        .bind(&schedule.bcc_emails)
        .bind(&schedule.subject)
        .bind(&schedule.body)
        .bind(schedule.is_html as i64)
        .bind(schedule.template_id)
        .bind(template_data_json)
        .bind(schedule.template_id.is_some() as i64)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if deactivate {
            sqlx::query(
                "UPDATE scheduled_emails SET is_active = 0, execution_count = execution_count + 1, last_executed_at = ? \
                 WHERE schedule_id = ?",
            )
            .bind(now)
            .bind(schedule.schedule_id.to_string())
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE scheduled_emails SET execution_count = execution_count + 1, last_executed_at = ?, next_run_time = ? \
                 WHERE schedule_id = ?",
            )
            .bind(now)
            .bind(next_run_time.map(|d| d.timestamp_millis()).unwrap_or(now))
            .bind(schedule.schedule_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(queue_id)
    }

    async fn append_processing_log(&self, log: NewProcessingLog) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let level_code = match log.log_level {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warning => 2,
            LogLevel::Error => 3,
        };
        let context_json = log.context_data.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            "INSERT INTO processing_logs \
             (log_level, category, message, exception, queue_id, worker_id, processing_step, context_data, correlation_id, machine_name, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(level_code)
        .bind(&log.category)
        .bind(&log.message)
        .bind(&log.exception)
        .bind(log.queue_id.map(|u| u.to_string()))
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
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(service_name, machine_name) DO UPDATE SET \
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
        .bind(status.last_heartbeat.timestamp_millis())
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
        let cutoff = (Utc::now() - window).timestamp_millis();
        let row = sqlx::query(
            "SELECT \
                SUM(CASE WHEN status = 2 THEN 1 ELSE 0 END) AS processed, \
                SUM(CASE WHEN status = 3 THEN 1 ELSE 0 END) AS failed, \
                AVG(processing_time_ms) AS avg_ms \
             FROM email_history WHERE sent_at >= ?",
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
                SELECT id FROM email_queue WHERE status = ? AND updated_at < ? LIMIT ?\
             )",
        )
        .bind(status.code())
        .bind(older_than.timestamp_millis())
        .bind(batch_size)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    async fn delete_old_history(&self, older_than: DateTime<Utc>, batch_size: u32) -> Result<u64> {
        let affected = sqlx::query(
            "DELETE FROM email_history WHERE id IN (\
                SELECT id FROM email_history WHERE sent_at < ? LIMIT ?\
             )",
        )
        .bind(older_than.timestamp_millis())
        .bind(batch_size)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    async fn delete_old_logs(&self, older_than: DateTime<Utc>, batch_size: u32) -> Result<u64> {
        let affected = sqlx::query(
            "DELETE FROM processing_logs WHERE id IN (\
                SELECT id FROM processing_logs WHERE created_at < ? LIMIT ?\
             )",
        )
        .bind(older_than.timestamp_millis())
        .bind(batch_size)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    async fn delete_old_service_status(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM service_status WHERE last_heartbeat < ?")
            .bind(older_than.timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    async fn fetch_history_for_archival(&self, older_than: DateTime<Utc>, batch_size: u32) -> Result<Vec<EmailHistory>> {
        let rows = sqlx::query(
            "SELECT * FROM email_history WHERE sent_at < ? ORDER BY sent_at ASC LIMIT ?",
        )
        .bind(older_than.timestamp_millis())
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok::<_, anyhow::Error>(EmailHistory {
                    id: row.get("id"),
                    queue_id: Uuid::parse_str(row.get("queue_id"))?,
                    to_emails: row.get("to_emails"),
                    cc_emails: row.try_get("cc_emails").ok(),
                    bcc_emails: row.try_get("bcc_emails").ok(),
                    subject: row.get("subject"),
                    final_body: row.get("final_body"),
                    status: QueueStatus::from_code(row.get::<i64, _>("status") as i16)
                        .ok_or_else(|| anyhow::anyhow!("unknown status"))?,
                    sent_at: millis_to_dt(Some(row.get("sent_at"))).unwrap(),
                    processing_time_ms: row.get("processing_time_ms"),
                    retry_count: row.get::<i64, _>("retry_count") as i32,
                    template_id: row.try_get("template_id").ok(),
                    template_used: row.try_get("template_used").ok(),
                    attachment_count: row.get::<i64, _>("attachment_count") as i32,
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
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_id TEXT UNIQUE NOT NULL,
                priority INTEGER NOT NULL DEFAULT 2,
                status INTEGER NOT NULL DEFAULT 0,
                to_emails TEXT NOT NULL,
                cc_emails TEXT,
                bcc_emails TEXT,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                is_html INTEGER NOT NULL DEFAULT 0,
                template_id INTEGER,
                template_data TEXT,
                requires_template_processing INTEGER NOT NULL DEFAULT 0,
                attachments TEXT,
                has_embedded_images INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                processing_started_at INTEGER,
                processed_at INTEGER,
                error_message TEXT,
                processed_by TEXT,
                scheduled_for INTEGER,
                is_scheduled INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                created_by TEXT,
                updated_at INTEGER NOT NULL,
                request_source TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_email_queue_claim ON email_queue(status, priority, created_at);
            CREATE INDEX IF NOT EXISTS idx_email_queue_scheduled ON email_queue(scheduled_for) WHERE is_scheduled = 1;
            CREATE INDEX IF NOT EXISTS idx_email_queue_failed_retry ON email_queue(retry_count) WHERE status = 3;

            CREATE TABLE IF NOT EXISTS email_templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                category TEXT,
                subject_template TEXT NOT NULL,
                body_template TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                version INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_email_templates_active_name
                ON email_templates(name) WHERE is_active = 1;

            CREATE TABLE IF NOT EXISTS email_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_id TEXT NOT NULL,
                to_emails TEXT NOT NULL,
                cc_emails TEXT,
                bcc_emails TEXT,
                subject TEXT NOT NULL,
                final_body TEXT NOT NULL,
                status INTEGER NOT NULL,
                sent_at INTEGER NOT NULL,
                processing_time_ms INTEGER NOT NULL,
                retry_count INTEGER NOT NULL,
                template_id INTEGER,
                template_used TEXT,
                attachment_count INTEGER NOT NULL DEFAULT 0,
                error_details TEXT,
                processed_by TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_email_history_sent_at ON email_history(sent_at);
            CREATE INDEX IF NOT EXISTS idx_email_history_queue_id ON email_history(queue_id);

            CREATE TABLE IF NOT EXISTS processing_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                log_level INTEGER NOT NULL,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                exception TEXT,
                queue_id TEXT,
                worker_id TEXT,
                processing_step TEXT,
                context_data TEXT,
                correlation_id TEXT,
                machine_name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processing_logs_created_at ON processing_logs(created_at);
            CREATE INDEX IF NOT EXISTS idx_processing_logs_queue_id ON processing_logs(queue_id);

            CREATE TABLE IF NOT EXISTS scheduled_emails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                schedule_id TEXT UNIQUE NOT NULL,
                next_run_time INTEGER NOT NULL,
                cron_expression TEXT,
                interval_minutes INTEGER,
                is_recurring INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                execution_count INTEGER NOT NULL DEFAULT 0,
                max_executions INTEGER,
                last_executed_at INTEGER,
                to_emails TEXT NOT NULL,
                cc_emails TEXT,
                bcc_emails TEXT,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                is_html INTEGER NOT NULL DEFAULT 0,
                template_id INTEGER,
                template_data TEXT,
                priority INTEGER NOT NULL DEFAULT 2,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_emails_due ON scheduled_emails(next_run_time) WHERE is_active = 1;

            CREATE TABLE IF NOT EXISTS service_status (
                service_name TEXT NOT NULL,
                machine_name TEXT NOT NULL,
                status TEXT NOT NULL,
                last_heartbeat INTEGER NOT NULL,
                queue_depth INTEGER NOT NULL DEFAULT 0,
                emails_per_hour REAL NOT NULL DEFAULT 0,
                error_rate REAL NOT NULL DEFAULT 0,
                avg_processing_ms REAL NOT NULL DEFAULT 0,
                cpu_percent REAL,
                memory_mb REAL,
                uptime_seconds INTEGER NOT NULL DEFAULT 0,
                total_processed INTEGER NOT NULL DEFAULT 0,
                total_failed INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (service_name, machine_name)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("initialized sqlite queue store schema");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mw_common::Priority;

    async fn test_repo() -> SqliteQueueRepository {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let repo = SqliteQueueRepository::new(pool);
        repo.init_schema().await.unwrap();
        repo
    }

    fn sample_item(priority: Priority) -> NewQueueItem {
        NewQueueItem {
            priority,
            to_emails: "a@x.test".to_string(),
            cc_emails: None,
            bcc_emails: None,
            subject: "Hi".to_string(),
            body: "Hello".to_string(),
            is_html: false,
            template_id: None,
            template_data: None,
            requires_template_processing: false,
            attachments: None,
            has_embedded_images: false,
            scheduled_for: None,
            is_scheduled: false,
            created_by: Some("test".to_string()),
            request_source: None,
        }
    }

    #[tokio::test]
    async fn test_claim_batch_orders_by_priority_then_created_at() {
        let repo = test_repo().await;
        repo.insert_queue_item(sample_item(Priority::Low)).await.unwrap();
        repo.insert_queue_item(sample_item(Priority::Critical)).await.unwrap();
        repo.insert_queue_item(sample_item(Priority::Normal)).await.unwrap();

        let claimed = repo.claim_batch("host-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert_eq!(claimed[0].priority, Priority::Critical);
        assert_eq!(claimed[1].priority, Priority::Normal);
        assert_eq!(claimed[2].priority, Priority::Low);
        assert!(claimed.iter().all(|i| i.status == QueueStatus::Processing));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_across_concurrent_claimers() {
        let repo = test_repo().await;
        repo.insert_queue_item(sample_item(Priority::Normal)).await.unwrap();

        let first = repo.claim_batch("host-1", 10).await.unwrap();
        let second = repo.claim_batch("host-2", 10).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 0);
    }

    #[tokio::test]
    async fn test_mark_sent_writes_history_once() {
        let repo = test_repo().await;
        let id = repo.insert_queue_item(sample_item(Priority::Normal)).await.unwrap();
        let claimed = repo.claim_batch("host-1", 10).await.unwrap();
        assert_eq!(claimed[0].queue_id, id);

        let ok = repo
            .mark_sent(id, "host-1", 42, "Hello", None, None, 0)
            .await
            .unwrap();
        assert!(ok);

        let stats = repo.get_queue_statistics().await.unwrap();
        assert_eq!(stats.sent, 1);
    }

    #[tokio::test]
    async fn test_mark_sent_noop_if_wrong_owner() {
        let repo = test_repo().await;
        let id = repo.insert_queue_item(sample_item(Priority::Normal)).await.unwrap();
        repo.claim_batch("host-1", 10).await.unwrap();

        let ok = repo.mark_sent(id, "host-2", 1, "Hello", None, None, 0).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_mark_failed_retries_then_exhausts() {
        let repo = test_repo().await;
        let id = repo.insert_queue_item(sample_item(Priority::Normal)).await.unwrap();

        for _ in 0..3 {
            repo.claim_batch("host-1", 10).await.unwrap();
            repo.mark_failed(id, "host-1", "timeout", true, 3, 0, "Hello", 0)
                .await
                .unwrap();
        }

        // retry_count now 3, matches max -> next failure is terminal
        repo.claim_batch("host-1", 10).await.unwrap();
        repo.mark_failed(id, "host-1", "timeout", true, 3, 0, "Hello", 0)
            .await
            .unwrap();

        let stats = repo.get_queue_statistics().await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_stuck_reset() {
        let repo = test_repo().await;
        let id = repo.insert_queue_item(sample_item(Priority::Normal)).await.unwrap();
        repo.claim_batch("host-1", 10).await.unwrap();

        // backdate processing_started_at
        sqlx::query("UPDATE email_queue SET processing_started_at = ? WHERE queue_id = ?")
            .bind((Utc::now() - chrono::Duration::minutes(30)).timestamp_millis())
            .bind(id.to_string())
            .execute(repo.pool())
            .await
            .unwrap();

        let stuck = repo.get_stuck(10, 100).await.unwrap();
        assert_eq!(stuck.len(), 1);

        let reset = repo.reset_stuck(10).await.unwrap();
        assert_eq!(reset, 1);

        let claimed = repo.claim_batch("host-2", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_idempotent_on_terminal_row() {
        let repo = test_repo().await;
        let id = repo.insert_queue_item(sample_item(Priority::Normal)).await.unwrap();
        assert!(repo.cancel(id).await.unwrap());
        assert!(!repo.cancel(id).await.unwrap());
    }
}
