//! Health Loop (§4.8): heartbeat, stuck-item recovery and aggregate alerts.

use crate::diskusage;
use chrono::Utc;
use mw_common::{Alert, AlertSeverity, ServiceStatus};
use mw_config::{CleanupConfig, ProcessingConfig, WorkerConfig};
use mw_queue::QueueRepository;
use mw_smtp::EmailTransport;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const QUEUE_DEPTH_WARNING: i64 = 1000;
const QUEUE_DEPTH_CRITICAL: i64 = 5000;
const FAILURE_RATE_WARNING: f64 = 0.10;
const LOW_THROUGHPUT_PER_HOUR: f64 = 10.0;
const LOW_THROUGHPUT_DEPTH_FLOOR: i64 = 100;
/// Disk-free alert fires this many percentage points before the cleanup
/// loop's own aggressive-retention threshold (§4.8 "disk free < threshold").
const DISK_FREE_WARNING_MARGIN_PERCENT: f64 = 5.0;

pub struct HealthLoop {
    repo: Arc<dyn QueueRepository>,
    transport: Arc<dyn EmailTransport>,
    processing: ProcessingConfig,
    worker: WorkerConfig,
    cleanup: CleanupConfig,
    machine_name: String,
    started_at: Instant,
}

impl HealthLoop {
    pub fn new(
        repo: Arc<dyn QueueRepository>,
        transport: Arc<dyn EmailTransport>,
        processing: ProcessingConfig,
        worker: WorkerConfig,
        cleanup: CleanupConfig,
        machine_name: String,
    ) -> Self {
        Self { repo, transport, processing, worker, cleanup, machine_name, started_at: Instant::now() }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let interval = std::time::Duration::from_secs(self.worker.health_check_interval_minutes.max(1) * 60);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.recv() => {
                    info!("health loop shutting down");
                    return;
                }
            }

            if let Err(err) = self.run_once().await {
                warn!(error = %err, "health check run failed");
            }
        }
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let smtp_ok = self.transport.test_connection().await;
        if !smtp_ok {
            warn!("smtp health probe failed");
        }

        let reset_count = self.repo.reset_stuck(self.processing.max_processing_time_minutes).await?;
        if reset_count > 0 {
            info!(reset_count, "reset stuck queue items");
        }

        let stats = self.repo.get_queue_statistics().await?;
        let (sent_last_hour, failed_last_hour, avg_ms) =
            self.repo.recent_throughput(&self.worker.service_name, chrono::Duration::hours(1)).await?;

        let total_last_hour = sent_last_hour + failed_last_hour;
        let failure_rate = if total_last_hour > 0 { failed_last_hour as f64 / total_last_hour as f64 } else { 0.0 };

        let probe_path = if self.cleanup.archival.enabled { Path::new(&self.cleanup.archival.path) } else { Path::new("/") };
        let disk_usage_percent = diskusage::used_percent(probe_path);

        let status = ServiceStatus {
            service_name: self.worker.service_name.clone(),
            machine_name: self.machine_name.clone(),
            status: if smtp_ok { "healthy".to_string() } else { "degraded".to_string() },
            last_heartbeat: Utc::now(),
            queue_depth: stats.queued + stats.processing,
            emails_per_hour: sent_last_hour as f64,
            error_rate: failure_rate,
            avg_processing_ms: avg_ms,
            cpu_percent: None,
            memory_mb: None,
            uptime_seconds: self.started_at.elapsed().as_secs() as i64,
            total_processed: stats.sent,
            total_failed: stats.failed,
        };
        self.repo.upsert_service_status(&status).await?;

        metrics::gauge!("mw_worker_queue_depth").set(status.queue_depth as f64);
        metrics::gauge!("mw_worker_error_rate").set(failure_rate);
        if let Some(percent) = disk_usage_percent {
            metrics::gauge!("mw_worker_disk_usage_percent").set(percent);
        }

        for alert in evaluate_alerts(&status, sent_last_hour, disk_usage_percent, self.cleanup.aggressive_threshold_percent) {
            dispatch_alert(alert);
        }

        Ok(())
    }
}

fn evaluate_alerts(status: &ServiceStatus, sent_last_hour: i64, disk_usage_percent: Option<f64>, aggressive_threshold_percent: f64) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if status.queue_depth > QUEUE_DEPTH_CRITICAL {
        alerts.push(Alert::new(AlertSeverity::Critical, format!("queue depth {} exceeds critical threshold", status.queue_depth)));
    } else if status.queue_depth > QUEUE_DEPTH_WARNING {
        alerts.push(Alert::new(AlertSeverity::Warning, format!("queue depth {} exceeds warning threshold", status.queue_depth)));
    }

    if status.error_rate > FAILURE_RATE_WARNING {
        alerts.push(Alert::new(
            AlertSeverity::Warning,
            format!("failure rate {:.1}% over the last hour", status.error_rate * 100.0),
        ));
    }

    if (sent_last_hour as f64) < LOW_THROUGHPUT_PER_HOUR && status.queue_depth > LOW_THROUGHPUT_DEPTH_FLOOR {
        alerts.push(Alert::new(
            AlertSeverity::Warning,
            format!("processing rate {sent_last_hour}/hr is low while queue depth is {}", status.queue_depth),
        ));
    }

    if let Some(used_percent) = disk_usage_percent {
        if used_percent >= aggressive_threshold_percent {
            alerts.push(Alert::new(
                AlertSeverity::Critical,
                format!("disk usage {used_percent:.1}% at or above the aggressive-cleanup threshold of {aggressive_threshold_percent:.1}%"),
            ));
        } else if used_percent >= aggressive_threshold_percent - DISK_FREE_WARNING_MARGIN_PERCENT {
            alerts.push(Alert::new(
                AlertSeverity::Warning,
                format!("disk usage {used_percent:.1}% is approaching the aggressive-cleanup threshold of {aggressive_threshold_percent:.1}%"),
            ));
        }
    }

    alerts
}

fn dispatch_alert(alert: Alert) {
    match alert.severity {
        AlertSeverity::Critical => error!(message = %alert.message, "health alert"),
        AlertSeverity::Warning => warn!(message = %alert.message, "health alert"),
    }
    metrics::counter!("mw_worker_alerts_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mw_common::QueueStatistics;

    fn base_status(queue_depth: i64, error_rate: f64) -> ServiceStatus {
        ServiceStatus {
            service_name: "mw-worker-service".to_string(),
            machine_name: "test-host".to_string(),
            status: "healthy".to_string(),
            last_heartbeat: Utc::now(),
            queue_depth,
            emails_per_hour: 0.0,
            error_rate,
            avg_processing_ms: 0.0,
            cpu_percent: None,
            memory_mb: None,
            uptime_seconds: 0,
            total_processed: 0,
            total_failed: 0,
        }
    }

    #[test]
    fn test_queue_statistics_default_is_zeroed() {
        let stats = QueueStatistics::default();
        assert_eq!(stats.queued, 0);
    }

    #[test]
    fn test_critical_queue_depth_raises_critical_alert() {
        let status = base_status(6000, 0.0);
        let alerts = evaluate_alerts(&status, 50, None, 90.0);
        assert!(alerts.iter().any(|a| matches!(a.severity, AlertSeverity::Critical)));
    }

    #[test]
    fn test_healthy_status_raises_no_alerts() {
        let status = base_status(10, 0.0);
        assert!(evaluate_alerts(&status, 50, Some(10.0), 90.0).is_empty());
    }

    #[test]
    fn test_high_failure_rate_raises_warning() {
        let status = base_status(10, 0.25);
        let alerts = evaluate_alerts(&status, 50, None, 90.0);
        assert!(alerts.iter().any(|a| matches!(a.severity, AlertSeverity::Warning)));
    }

    #[test]
    fn test_disk_usage_past_threshold_raises_critical_alert() {
        let status = base_status(10, 0.0);
        let alerts = evaluate_alerts(&status, 50, Some(95.0), 90.0);
        assert!(alerts.iter().any(|a| matches!(a.severity, AlertSeverity::Critical)));
    }

    #[test]
    fn test_disk_usage_near_threshold_raises_warning() {
        let status = base_status(10, 0.0);
        let alerts = evaluate_alerts(&status, 50, Some(87.0), 90.0);
        assert!(alerts.iter().any(|a| matches!(a.severity, AlertSeverity::Warning)));
    }
}
