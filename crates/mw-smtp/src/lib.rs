//! SMTP Transport (§4.4): one interface, `send(envelope) -> {ok |
//! transient_error | permanent_error}`, backed by `lettre`.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::PoolConfig;
use lettre::{Message, SmtpTransport as LettreSmtpTransport, Transport};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SmtpSetupError {
    #[error("invalid SMTP host/TLS configuration: {0}")]
    Tls(#[from] lettre::transport::smtp::Error),
}

/// Transport-level outcome (§7): transient failures are retry-eligible,
/// permanent failures are not.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Sent,
    Transient(String),
    Permanent(String),
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_ssl: bool,
    pub use_tls: bool,
    pub timeout: Duration,
    pub max_connections: u32,
    pub pool_idle: Duration,
}

impl From<&mw_config::SmtpConfig> for SmtpSettings {
    fn from(cfg: &mw_config::SmtpConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            use_ssl: cfg.use_ssl,
            use_tls: cfg.use_tls,
            timeout: Duration::from_secs(cfg.timeout_s),
            max_connections: cfg.max_connections,
            pool_idle: Duration::from_secs(cfg.pool_idle_minutes * 60),
        }
    }
}

/// SMTP Transport contract. Implementations must classify failures per §7:
/// 5xx / auth / TLS verification -> permanent; timeouts / 4xx / connection
/// reset -> transient.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: Message) -> SendOutcome;

    /// Connects and disconnects without sending (§4.8 health probe).
    async fn test_connection(&self) -> bool;
}

pub struct LettreEmailTransport {
    transport: LettreSmtpTransport,
}

impl LettreEmailTransport {
    pub fn new(settings: &SmtpSettings) -> Result<Self, SmtpSetupError> {
        let mut builder = LettreSmtpTransport::builder_dangerous(&settings.host)
            .port(settings.port)
            .timeout(Some(settings.timeout))
            .pool_config(PoolConfig::new().max_size(settings.max_connections).idle_timeout(settings.pool_idle));

        builder = if settings.use_ssl {
            let params = TlsParameters::new(settings.host.clone())?;
            builder.tls(Tls::Wrapper(params))
        } else if settings.use_tls {
            let params = TlsParameters::new(settings.host.clone())?;
            builder.tls(Tls::Required(params))
        } else {
            builder.tls(Tls::None)
        };

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self { transport: builder.build() })
    }
}

#[async_trait]
impl EmailTransport for LettreEmailTransport {
    async fn send(&self, message: Message) -> SendOutcome {
        let transport = self.transport.clone();
        let result = tokio::task::spawn_blocking(move || transport.send(&message)).await;

        match result {
            Ok(Ok(response)) => {
                debug!(code = ?response.code(), "smtp accepted message");
                SendOutcome::Sent
            }
            Ok(Err(err)) => classify(&err),
            Err(join_err) => SendOutcome::Transient(format!("smtp send task panicked: {join_err}")),
        }
    }

    async fn test_connection(&self) -> bool {
        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.test_connection().unwrap_or(false)).await.unwrap_or(false)
    }
}

fn classify(err: &lettre::transport::smtp::Error) -> SendOutcome {
    if err.is_permanent() {
        SendOutcome::Permanent(err.to_string())
    } else if err.is_transient() {
        SendOutcome::Transient(err.to_string())
    } else if err.is_timeout() {
        SendOutcome::Transient(err.to_string())
    } else if err.is_tls() || err.is_client() {
        SendOutcome::Permanent(err.to_string())
    } else {
        warn!(error = %err, "unclassified smtp error, treating as transient");
        SendOutcome::Transient(err.to_string())
    }
}
