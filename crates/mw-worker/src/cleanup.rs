//! Cleanup Loop (§4.7): retention-windowed deletion/archival, aligned to a
//! configured wall-clock time, running in `cleanup_batch_size` batches.

use crate::diskusage;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use mw_config::CleanupConfig;
use mw_queue::QueueRepository;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Retention windows are halved once disk usage crosses
/// `aggressive_threshold_percent` (§4.7 "aggressive cleanup").
const AGGRESSIVE_RETENTION_FACTOR: i64 = 2;

pub struct CleanupLoop {
    repo: Arc<dyn QueueRepository>,
    config: CleanupConfig,
}

impl CleanupLoop {
    pub fn new(repo: Arc<dyn QueueRepository>, config: CleanupConfig) -> Self {
        Self { repo, config }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let wait = time_until_next_run(&self.config.cleanup_time_utc, self.config.cleanup_interval_hours);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.recv() => {
                    info!("cleanup loop shutting down");
                    return;
                }
            }

            if let Err(err) = self.run_once().await {
                warn!(error = %err, "cleanup run failed, will retry next cycle");
            }
        }
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        info!("cleanup run starting");
        let now = Utc::now();

        let probe_path = if self.config.archival.enabled { Path::new(&self.config.archival.path) } else { Path::new("/") };
        let disk_usage_percent = diskusage::used_percent(probe_path).unwrap_or(0.0);
        metrics::gauge!("mw_worker_disk_usage_percent").set(disk_usage_percent);

        let aggressive = disk_usage_percent >= self.config.aggressive_threshold_percent;
        if aggressive {
            warn!(
                disk_usage_percent,
                threshold = self.config.aggressive_threshold_percent,
                "disk usage over threshold, shortening retention windows for this run"
            );
        }
        let history_cutoff = now - ChronoDuration::days(shorten_if_aggressive(self.config.email_history_retention_days, aggressive));
        let log_cutoff = now - ChronoDuration::days(shorten_if_aggressive(self.config.processing_log_retention_days, aggressive));
        let failed_cutoff = now - ChronoDuration::days(shorten_if_aggressive(self.config.failed_email_retention_days, aggressive));
        let sent_cutoff = now - ChronoDuration::days(shorten_if_aggressive(self.config.successful_email_retention_days, aggressive));
        let status_cutoff = now - ChronoDuration::days(self.config.service_status_retention_days);

        if self.config.archival.enabled {
            self.archive_history(history_cutoff).await?;
        }

        let history_deleted = self.delete_in_batches(history_cutoff, |cutoff, batch| {
            let repo = self.repo.clone();
            Box::pin(async move { repo.delete_old_history(cutoff, batch).await })
        }).await?;

        let logs_deleted = self.delete_in_batches(log_cutoff, |cutoff, batch| {
            let repo = self.repo.clone();
            Box::pin(async move { repo.delete_old_logs(cutoff, batch).await })
        }).await?;

        let failed_deleted = self.delete_in_batches(failed_cutoff, |cutoff, batch| {
            let repo = self.repo.clone();
            Box::pin(async move { repo.delete_old_queue_items(mw_common::QueueStatus::Failed, cutoff, batch).await })
        }).await?;

        let sent_deleted = self.delete_in_batches(sent_cutoff, |cutoff, batch| {
            let repo = self.repo.clone();
            Box::pin(async move { repo.delete_old_queue_items(mw_common::QueueStatus::Sent, cutoff, batch).await })
        }).await?;

        let status_deleted = self.repo.delete_old_service_status(status_cutoff).await?;

        info!(
            history_deleted, logs_deleted, failed_deleted, sent_deleted, status_deleted,
            "cleanup run finished"
        );
        metrics::counter!("mw_worker_cleanup_rows_deleted_total")
            .increment(history_deleted + logs_deleted + failed_deleted + sent_deleted + status_deleted);
        Ok(())
    }

    async fn delete_in_batches<F>(&self, cutoff: DateTime<Utc>, delete: F) -> anyhow::Result<u64>
    where
        F: Fn(DateTime<Utc>, u32) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<u64>> + Send>>,
    {
        let mut total = 0u64;
        loop {
            let deleted = delete(cutoff, self.config.cleanup_batch_size).await?;
            total += deleted;
            if deleted < self.config.cleanup_batch_size as u64 {
                break;
            }
        }
        Ok(total)
    }

    /// Writes EmailHistory rows older than `cutoff` to the archive directory
    /// before they are deleted, rotating when the current file would exceed
    /// `max_file_size_mb` (§4.7).
    async fn archive_history(&self, cutoff: DateTime<Utc>) -> anyhow::Result<()> {
        let max_bytes = self.config.archival.max_file_size_mb * 1024 * 1024;
        tokio::fs::create_dir_all(&self.config.archival.path).await?;

        loop {
            let rows = self.repo.fetch_history_for_archival(cutoff, self.config.cleanup_batch_size).await?;
            if rows.is_empty() {
                break;
            }

            let date = Utc::now().format("%Y-%m-%d");
            let path = self.pick_archive_path(&date.to_string(), max_bytes).await?;
            let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            for row in &rows {
                let line = serde_json::to_string(row)?;
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            debug!(path = %path.display(), rows = rows.len(), "archived email history batch");

            if rows.len() < self.config.cleanup_batch_size as usize {
                break;
            }
        }
        Ok(())
    }

    async fn pick_archive_path(&self, date: &str, max_bytes: u64) -> anyhow::Result<std::path::PathBuf> {
        let ext = if self.config.archival.format == "csv" { "csv" } else { "json" };
        let base = Path::new(&self.config.archival.path);
        let mut index = 0u32;
        loop {
            let name = if index == 0 {
                format!("emailhistory-{date}.{ext}")
            } else {
                format!("emailhistory-{date}-{index}.{ext}")
            };
            let path = base.join(name);
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            if size < max_bytes {
                return Ok(path);
            }
            index += 1;
        }
    }
}

/// Halves a retention window when `aggressive` is set, keeping at least one day.
fn shorten_if_aggressive(configured_days: i64, aggressive: bool) -> i64 {
    if aggressive {
        (configured_days / AGGRESSIVE_RETENTION_FACTOR).max(1)
    } else {
        configured_days
    }
}

/// Next wall-clock-aligned run time, UTC (§9: cleanup time is explicitly UTC).
fn time_until_next_run(cleanup_time_utc: &str, interval_hours: i64) -> std::time::Duration {
    let target = NaiveTime::parse_from_str(cleanup_time_utc, "%H:%M").unwrap_or_else(|_| NaiveTime::from_hms_opt(2, 0, 0).unwrap());
    let now = Utc::now();
    let mut next = now.date_naive().and_time(target).and_utc();
    if next <= now {
        next += ChronoDuration::hours(interval_hours.max(1));
    }
    (next - now).to_std().unwrap_or(std::time::Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_until_next_run_is_positive() {
        let wait = time_until_next_run("02:00", 24);
        assert!(wait.as_secs() > 0);
    }

    #[test]
    fn test_shorten_if_aggressive_halves_retention() {
        assert_eq!(shorten_if_aggressive(90, true), 45);
        assert_eq!(shorten_if_aggressive(90, false), 90);
    }

    #[test]
    fn test_shorten_if_aggressive_floors_at_one_day() {
        assert_eq!(shorten_if_aggressive(1, true), 1);
    }
}
