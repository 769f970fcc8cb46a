//! Email Worker Service
//!
//! Long-lived process draining the shared `EmailQueue` table: claims work,
//! renders templates, lifts inline images, dispatches over SMTP, and runs
//! the scheduler/cleanup/health background loops.
//!
//! No command-line arguments beyond an optional config file path via
//! `MW_CONFIG_PATH`; exits 0 on graceful shutdown, non-zero on fatal
//! startup errors (missing/unreachable database).
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MW_CONFIG_PATH` | - | Path to a TOML config file (optional) |
//! | `MW_DATABASE_KIND` | `sqlite` | `sqlite` or `postgres` |
//! | `MW_DATABASE_CONNECTION_STRING` | `sqlite://emailworker.db` | Database connection string |
//! | `MW_METRICS_PORT` | `9090` | Metrics/health HTTP port |
//! | `RUST_LOG` | `info` | Log level filter |
//! | `LOG_FORMAT` | text | `json` for structured output |
//!
//! See [`mw_config::AppConfig`] for the full set of `MW_*` overrides
//! recognized per configuration section.

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use mw_config::AppConfig;
use mw_queue::QueueRepository;
use mw_smtp::{EmailTransport, LettreEmailTransport, SmtpSettings};
use mw_worker::{CleanupLoop, DispatchLoop, HealthLoop, SchedulerLoop};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    mw_common::logging::init_logging("mw-worker-service");
    info!("starting email worker service");

    let config = AppConfig::load().context("failed to load configuration")?;
    let metrics_port: u16 = env_or_parse("MW_METRICS_PORT", 9090);
    let prometheus_handle = PrometheusBuilder::new().install_recorder().context("failed to install prometheus recorder")?;

    let repo = create_queue_repository(&config).await?;
    repo.init_schema().await.context("failed to initialize database schema")?;
    info!(kind = %config.database.kind, "queue repository ready");

    let transport: Arc<dyn EmailTransport> =
        Arc::new(LettreEmailTransport::new(&SmtpSettings::from(&config.smtp)).context("failed to configure SMTP transport")?);

    let hostname = hostname_or_unknown();
    let worker_id = mw_queue::worker_id(&hostname, std::process::id() as u64);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let dispatch = DispatchLoop::new(
        repo.clone(),
        transport.clone(),
        config.processing.clone(),
        config.smtp.clone(),
        worker_id,
        hostname.clone(),
    );
    let dispatch_handle = spawn_loop("dispatch", shutdown_tx.subscribe(), move |rx| async move { dispatch.run(rx).await });

    let scheduler = SchedulerLoop::new(repo.clone(), config.worker.scheduled_check_interval_minutes);
    let scheduler_handle = spawn_loop("scheduler", shutdown_tx.subscribe(), move |rx| async move { scheduler.run(rx).await });

    let cleanup = CleanupLoop::new(repo.clone(), config.cleanup.clone());
    let cleanup_handle = spawn_loop("cleanup", shutdown_tx.subscribe(), move |rx| async move { cleanup.run(rx).await });

    let health =
        HealthLoop::new(repo.clone(), transport.clone(), config.processing.clone(), config.worker.clone(), config.cleanup.clone(), hostname);
    let health_handle = spawn_loop("health", shutdown_tx.subscribe(), move |rx| async move { health.run(rx).await });

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    info!(%metrics_addr, "metrics server listening");
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .with_state(prometheus_handle);

    let listener = tokio::net::TcpListener::bind(metrics_addr).await.context("failed to bind metrics listener")?;
    let metrics_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("email worker service started, press Ctrl+C to shut down");
    shutdown_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = dispatch_handle.await;
        let _ = scheduler_handle.await;
        let _ = cleanup_handle.await;
        let _ = health_handle.await;
        let _ = metrics_handle.await;
    })
    .await;

    info!("email worker service shutdown complete");
    Ok(())
}

fn spawn_loop<F, Fut>(name: &'static str, rx: broadcast::Receiver<()>, run: F) -> tokio::task::JoinHandle<()>
where
    F: FnOnce(broadcast::Receiver<()>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        run(rx).await;
        info!(loop_name = name, "background loop exited");
    })
}

async fn create_queue_repository(config: &AppConfig) -> Result<Arc<dyn QueueRepository>> {
    match config.database.kind.as_str() {
        "sqlite" => {
            let pool = SqlitePoolOptions::new()
                .max_connections(config.database.max_connections)
                .connect(&config.database.connection_string)
                .await
                .context("failed to connect to sqlite database")?;
            Ok(Arc::new(mw_queue::sqlite::SqliteQueueRepository::new(pool)))
        }
        "postgres" => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .connect(&config.database.connection_string)
                .await
                .context("failed to connect to postgres database")?;
            Ok(Arc::new(mw_queue::postgres::PostgresQueueRepository::new(pool)))
        }
        other => Err(anyhow::anyhow!("unknown database kind '{other}', expected 'sqlite' or 'postgres'")),
    }
}

fn hostname_or_unknown() -> String {
    hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_else(|| "unknown-host".to_string())
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "UP", "version": env!("CARGO_PKG_VERSION") }))
}

async fn ready_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "READY" }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
