use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::info;

use crate::config::SmtpConfig;
use crate::error::{ConfigError, EtlError};

/// Outbound notification channel used by the alert evaluator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), EtlError>;
}

/// Mail to one fixed recipient over an authenticated STARTTLS submission
/// session.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig, recipient: &str, timeout: Duration) -> Result<Self, EtlError> {
        let from = parse_mailbox("SMTP_FROM", &config.from)?;
        let to = parse_mailbox("ALERT_EMAIL_TO", recipient)?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| ConfigError::Invalid {
                key: "SMTP_HOST",
                value: config.host.clone(),
                reason: e.to_string(),
            })?
            .port(config.port)
            .credentials(Credentials::new(config.username.clone(), config.password.clone()))
            .timeout(Some(timeout))
            .build();

        Ok(Self { transport, from, to })
    }
}

fn parse_mailbox(key: &'static str, raw: &str) -> Result<Mailbox, ConfigError> {
    raw.parse::<Mailbox>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, subject: &str, body: &str) -> Result<(), EtlError> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| EtlError::Notification(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| EtlError::Notification(e.to_string()))?;

        info!(to = %self.to, subject, "alert mail sent");
        Ok(())
    }
}
