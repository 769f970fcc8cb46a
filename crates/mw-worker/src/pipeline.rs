//! Processing Pipeline (§4.3): the ordered stages run once per claimed
//! `QueueItem`. Each stage either produces the next stage's input or
//! short-circuits to a tagged [`mw_common::PipelineOutcome`] — no exception
//! propagates past this module.

use lettre::message::Mailbox;
use mw_common::{LogLevel, PipelineOutcome, QueueItem};
use mw_config::{ProcessingConfig, SmtpConfig};
use mw_queue::{NewProcessingLog, QueueRepository};
use mw_smtp::{EmailTransport, SendOutcome};
use std::time::Instant;
use tracing::{info, warn};

enum StageError {
    Validation(String),
    Transient(String),
    Permanent(String),
}

impl StageError {
    fn into_outcome(self) -> PipelineOutcome {
        match self {
            StageError::Validation(message) => PipelineOutcome::ValidationErr { message },
            StageError::Transient(message) => PipelineOutcome::TransientErr { message },
            StageError::Permanent(message) => PipelineOutcome::PermanentErr { message },
        }
    }
}

/// Everything a single pipeline run needs; borrowed for the duration of one
/// item so every claimed row gets its own scope (§5 "task-local data
/// sessions" — never shared across tasks).
pub struct PipelineContext<'a> {
    pub repo: &'a dyn QueueRepository,
    pub transport: &'a dyn EmailTransport,
    pub processing: &'a ProcessingConfig,
    pub smtp: &'a SmtpConfig,
    pub worker_id: &'a str,
    pub machine_name: &'a str,
}

pub async fn process_item(ctx: &PipelineContext<'_>, item: QueueItem) -> PipelineOutcome {
    let start = Instant::now();
    log_step(ctx, &item, LogLevel::Info, "start", "processing started", None).await;

    // Tracks the body as stages rewrite it (template render, then CID lift) so
    // the EmailHistory row can persist what was actually composed/sent (§3
    // "final_body (post-render)") even when a later stage fails.
    let mut body = item.body.clone();

    let deadline = std::time::Duration::from_secs((ctx.processing.max_processing_time_minutes.max(1) as u64) * 60);
    let outcome = match tokio::time::timeout(deadline, run_stages(ctx, &item, &mut body)).await {
        Ok(result) => result,
        Err(_) => Err(StageError::Transient(format!(
            "processing exceeded soft deadline of {} minutes",
            ctx.processing.max_processing_time_minutes
        ))),
    };

    let elapsed_ms = start.elapsed().as_millis() as i64;
    match outcome {
        Ok(attachment_count) => match finalize_sent(ctx, &item, elapsed_ms, attachment_count, &body).await {
            Ok(()) => PipelineOutcome::Sent { processing_time_ms: elapsed_ms },
            Err(message) => PipelineOutcome::TransientErr { message },
        },
        Err(stage_error) => {
            finalize_failed(ctx, &item, &stage_error, &body).await;
            stage_error.into_outcome()
        }
    }
}

/// Runs stages 1-5 of §4.3 and returns the attachment count on success
/// (needed for the EmailHistory row written by [`finalize_sent`]). `body`
/// is rewritten in place by template render and CID lift so it reflects the
/// final rendered content regardless of where a later stage fails.
async fn run_stages(ctx: &PipelineContext<'_>, item: &QueueItem, body: &mut String) -> Result<i32, StageError> {
    let specs = item.attachments.clone().unwrap_or_default();
    let max_attachment_bytes = ctx.processing.max_attachment_size_mb * 1024 * 1024;
    let max_total_bytes = ctx.processing.max_email_size_mb * 1024 * 1024;
    let validated = mw_mime::validate_attachments(&specs, max_attachment_bytes, max_total_bytes)
        .map_err(|err| StageError::Validation(err.to_string()))?;

    let mut subject = item.subject.clone();
    if item.requires_template_processing {
        let template_id = item
            .template_id
            .ok_or_else(|| StageError::Validation("requires_template_processing set without template_id".to_string()))?;
        let template = ctx
            .repo
            .get_active_template(template_id)
            .await
            .map_err(|err| StageError::Transient(format!("template lookup failed: {err}")))?
            .ok_or_else(|| StageError::Validation(format!("no active template with id {template_id}")))?;
        let data = item.template_data.clone().unwrap_or(serde_json::Value::Null);
        subject = mw_template::render_subject(&template.subject_template, &data)
            .map_err(|err| StageError::Validation(err.to_string()))?;
        *body = mw_template::render_body(&template.body_template, &data, item.is_html)
            .map_err(|err| StageError::Validation(err.to_string()))?;
    }

    let mut inline_images = Vec::new();
    if item.is_html && (item.has_embedded_images || body.contains("data:image")) {
        let lifted = mw_mime::lift_images(body.as_str()).map_err(|err| StageError::Validation(err.to_string()))?;
        *body = lifted.body;
        inline_images = lifted.images;
    }

    let to = mw_mime::parse_recipients(&item.to_emails).map_err(|err| StageError::Validation(err.to_string()))?;
    let cc = match &item.cc_emails {
        Some(raw) if !raw.trim().is_empty() => {
            mw_mime::parse_recipients(raw).map_err(|err| StageError::Validation(err.to_string()))?
        }
        _ => Vec::new(),
    };
    let bcc = match &item.bcc_emails {
        Some(raw) if !raw.trim().is_empty() => {
            mw_mime::parse_recipients(raw).map_err(|err| StageError::Validation(err.to_string()))?
        }
        _ => Vec::new(),
    };
    let recipient_count = to.len() + cc.len() + bcc.len();
    if recipient_count as u32 > ctx.processing.max_recipients_per_email {
        return Err(StageError::Validation(format!(
            "{recipient_count} recipients exceeds the configured maximum of {}",
            ctx.processing.max_recipients_per_email
        )));
    }

    let sender: Mailbox = format!("{} <{}>", ctx.smtp.sender_name, ctx.smtp.sender_email)
        .parse()
        .map_err(|_| StageError::Validation(format!("invalid configured sender_email '{}'", ctx.smtp.sender_email)))?;

    let attachment_count = (inline_images.len() + validated.len()) as i32;
    let message = mw_mime::compose_message(&sender, &to, &cc, &bcc, &subject, body.as_str(), item.is_html, &inline_images, &validated)
        .map_err(|err| StageError::Validation(err.to_string()))?;

    match ctx.transport.send(message).await {
        SendOutcome::Sent => {
            log_step(ctx, item, LogLevel::Info, "smtp_dispatch", "message accepted by transport", None).await;
            Ok(attachment_count)
        }
        SendOutcome::Transient(reason) => Err(StageError::Transient(reason)),
        SendOutcome::Permanent(reason) => Err(StageError::Permanent(reason)),
    }
}

async fn finalize_sent(ctx: &PipelineContext<'_>, item: &QueueItem, elapsed_ms: i64, attachment_count: i32, final_body: &str) -> Result<(), String> {
    let template_used = item.template_id.map(|_| "rendered".to_string());
    let sent = ctx
        .repo
        .mark_sent(item.queue_id, ctx.worker_id, elapsed_ms, final_body, item.template_id, template_used.as_deref(), attachment_count)
        .await
        .map_err(|err| format!("failed to record sent status: {err}"))?;

    if sent {
        info!(queue_id = %item.queue_id, elapsed_ms, "email sent");
        log_step(ctx, item, LogLevel::Info, "success", "email sent", None).await;
    } else {
        warn!(queue_id = %item.queue_id, "mark_sent was a no-op (item reclaimed or no longer processing)");
    }
    Ok(())
}

async fn finalize_failed(ctx: &PipelineContext<'_>, item: &QueueItem, stage_error: &StageError, final_body: &str) {
    let (allow_retry, message) = match stage_error {
        StageError::Validation(message) => (false, message.clone()),
        StageError::Transient(message) => (true, message.clone()),
        StageError::Permanent(message) => (false, message.clone()),
    };

    if let Err(err) = ctx
        .repo
        .mark_failed(
            item.queue_id,
            ctx.worker_id,
            &message,
            allow_retry,
            ctx.processing.max_retry_attempts,
            ctx.processing.retry_delay_minutes,
            final_body,
            0,
        )
        .await
    {
        warn!(queue_id = %item.queue_id, error = %err, "failed to record failure status");
    }

    let level = if allow_retry { LogLevel::Warning } else { LogLevel::Error };
    log_step(ctx, item, level, "failure", &message, Some(message.clone())).await;
}

async fn log_step(ctx: &PipelineContext<'_>, item: &QueueItem, level: LogLevel, step: &str, message: &str, exception: Option<String>) {
    let log = NewProcessingLog {
        log_level: level,
        category: "pipeline".to_string(),
        message: message.to_string(),
        exception,
        queue_id: Some(item.queue_id),
        worker_id: Some(ctx.worker_id.to_string()),
        processing_step: Some(step.to_string()),
        context_data: None,
        correlation_id: None,
        machine_name: ctx.machine_name.to_string(),
    };
    if let Err(err) = ctx.repo.append_processing_log(log).await {
        warn!(queue_id = %item.queue_id, error = %err, "failed to append processing log");
    }
}
