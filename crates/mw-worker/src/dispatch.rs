//! Dispatch Loop (§4.2): claim a batch, fan it out to bounded concurrent
//! workers, wait for the whole batch to finish before claiming again.

use crate::pipeline::{process_item, PipelineContext};
use mw_config::{ProcessingConfig, SmtpConfig};
use mw_queue::QueueRepository;
use mw_smtp::EmailTransport;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

pub struct DispatchLoop {
    repo: Arc<dyn QueueRepository>,
    transport: Arc<dyn EmailTransport>,
    processing: ProcessingConfig,
    smtp: SmtpConfig,
    worker_id: String,
    machine_name: String,
    semaphore: Arc<Semaphore>,
}

impl DispatchLoop {
    pub fn new(
        repo: Arc<dyn QueueRepository>,
        transport: Arc<dyn EmailTransport>,
        processing: ProcessingConfig,
        smtp: SmtpConfig,
        worker_id: String,
        machine_name: String,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(processing.max_concurrent_workers.max(1)));
        Self { repo, transport, processing, smtp, worker_id, machine_name, semaphore }
    }

    /// Runs until `shutdown_rx` fires. In-flight items are allowed to finish
    /// their current SMTP send (§4.2); anything still `Processing` at forced
    /// shutdown is recovered by the Health Loop's stuck reset on restart.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let interval = std::time::Duration::from_secs(self.processing.polling_interval_s.max(1));
        loop {
            let claimed = tokio::select! {
                result = self.repo.claim_batch(&self.worker_id, self.processing.batch_size) => result,
                _ = shutdown_rx.recv() => {
                    info!("dispatch loop shutting down");
                    return;
                }
            };

            let items = match claimed {
                Ok(items) => items,
                Err(err) => {
                    warn!(error = %err, "claim_batch failed, will retry next tick");
                    Vec::new()
                }
            };

            if items.is_empty() {
                debug!("no eligible queue items, sleeping");
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.recv() => {
                        info!("dispatch loop shutting down");
                        return;
                    }
                }
                continue;
            }

            metrics::gauge!("mw_worker_dispatch_batch_size").set(items.len() as f64);

            let mut handles = Vec::with_capacity(items.len());
            for item in items {
                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("dispatch semaphore closed, aborting batch");
                        break;
                    }
                };
                let repo = self.repo.clone();
                let transport = self.transport.clone();
                let processing = self.processing.clone();
                let smtp = self.smtp.clone();
                let worker_id = self.worker_id.clone();
                let machine_name = self.machine_name.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    let ctx = PipelineContext {
                        repo: repo.as_ref(),
                        transport: transport.as_ref(),
                        processing: &processing,
                        smtp: &smtp,
                        worker_id: &worker_id,
                        machine_name: &machine_name,
                    };
                    process_item(&ctx, item).await
                }));
            }

            // Batch barrier (§5): next claim never starts before this batch drains.
            for handle in handles {
                match handle.await {
                    Ok(outcome) => record_outcome(&outcome),
                    Err(join_err) => warn!(error = %join_err, "pipeline task panicked"),
                }
            }
        }
    }
}

fn record_outcome(outcome: &mw_common::PipelineOutcome) {
    match outcome {
        mw_common::PipelineOutcome::Sent { processing_time_ms } => {
            metrics::counter!("mw_worker_items_sent_total").increment(1);
            metrics::histogram!("mw_worker_processing_time_ms").record(*processing_time_ms as f64);
        }
        mw_common::PipelineOutcome::TransientErr { .. } => {
            metrics::counter!("mw_worker_items_transient_failed_total").increment(1);
        }
        mw_common::PipelineOutcome::PermanentErr { .. } => {
            metrics::counter!("mw_worker_items_permanent_failed_total").increment(1);
        }
        mw_common::PipelineOutcome::ValidationErr { .. } => {
            metrics::counter!("mw_worker_items_validation_failed_total").increment(1);
        }
    }
}
