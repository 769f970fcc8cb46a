//! Scheduler Loop (§4.6): promotes due `ScheduledEmail` rows into the
//! queue and advances their recurrence, atomically per row.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use mw_common::ScheduledEmail;
use mw_queue::QueueRepository;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub struct SchedulerLoop {
    repo: Arc<dyn QueueRepository>,
    check_interval: std::time::Duration,
    promote_batch_size: u32,
}

impl SchedulerLoop {
    pub fn new(repo: Arc<dyn QueueRepository>, check_interval_minutes: u64) -> Self {
        Self {
            repo,
            check_interval: std::time::Duration::from_secs(check_interval_minutes.max(1) * 60),
            promote_batch_size: 100,
        }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                _ = shutdown_rx.recv() => {
                    info!("scheduler loop shutting down");
                    return;
                }
            }

            let due = match self.repo.fetch_due_scheduled(self.promote_batch_size).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(error = %err, "fetch_due_scheduled failed, will retry next tick");
                    continue;
                }
            };

            for schedule in due {
                self.promote_one(&schedule).await;
            }
        }
    }

    async fn promote_one(&self, schedule: &ScheduledEmail) {
        let (next_run_time, deactivate) = next_occurrence(schedule);
        match self.repo.promote_scheduled(schedule, next_run_time, deactivate).await {
            Ok(queue_id) => {
                metrics::counter!("mw_worker_scheduled_promotions_total").increment(1);
                info!(schedule_id = %schedule.schedule_id, %queue_id, deactivate, "promoted scheduled email");
            }
            Err(err) => {
                error!(schedule_id = %schedule.schedule_id, error = %err, "failed to promote scheduled email");
            }
        }
    }
}

/// Computes the schedule's next `next_run_time`, or signals deactivation if
/// the row is not recurring or its recurrence cannot be resolved (§4.6 step 3).
fn next_occurrence(schedule: &ScheduledEmail) -> (Option<DateTime<Utc>>, bool) {
    if !schedule.is_recurring {
        return (None, true);
    }

    if let Some(expr) = &schedule.cron_expression {
        // §6 "5-field standard"; the `cron` crate expects a leading seconds field.
        let six_field = format!("0 {expr}");
        match Schedule::from_str(&six_field) {
            Ok(parsed) => match parsed.after(&Utc::now()).next() {
                Some(next) => return (Some(next), false),
                None => {
                    warn!(cron_expression = %expr, "cron expression has no future occurrences, deactivating");
                    return (None, true);
                }
            },
            Err(err) => {
                error!(cron_expression = %expr, error = %err, "invalid cron expression, deactivating");
                return (None, true);
            }
        }
    }

    if let Some(minutes) = schedule.interval_minutes {
        if minutes > 0 {
            return (Some(Utc::now() + ChronoDuration::minutes(minutes as i64)), false);
        }
    }

    warn!(schedule_id = %schedule.schedule_id, "recurring schedule has neither cron_expression nor interval_minutes, deactivating");
    (None, true)
}
