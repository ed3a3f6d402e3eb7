//! Email alerts via SMTP.
//!
//! [`EmailAlerts`] wraps lettre's async SMTP transport (STARTTLS relay) and
//! sends one plain-text message per recipient for every alert.

use anyhow::Result;
use async_trait::async_trait;
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{info, warn};

use super::{Alert, AlertSink};
use crate::config::SmtpConfig;

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("email build error: {0}")]
    Build(#[from] lettre::error::Error),
}

pub struct EmailAlerts {
    smtp: SmtpConfig,
    recipients: Vec<String>,
}

impl EmailAlerts {
    pub fn new(smtp: SmtpConfig, recipients: Vec<String>) -> Self {
        Self { smtp, recipients }
    }

    fn message(&self, to: &str, alert: &Alert) -> Result<Message, EmailError> {
        Ok(Message::builder()
            .from(self.smtp.from.parse()?)
            .to(to.parse()?)
            .subject(alert.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(alert.body())?)
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, EmailError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.smtp.host)?
            .port(self.smtp.port);
        if let (Some(user), Some(pass)) = (&self.smtp.user, &self.smtp.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl AlertSink for EmailAlerts {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        if self.recipients.is_empty() {
            warn!(key = %alert.target, "Alert raised but no recipients are configured");
            return Ok(());
        }

        let mailer = self.transport()?;
        let mut failed = 0usize;
        for to in &self.recipients {
            let sent = match self.message(to, alert) {
                Ok(message) => mailer.send(message).await.map(|_| ()).map_err(EmailError::from),
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => info!(to = %to, key = %alert.target, "📧 Alert email sent"),
                Err(e) => {
                    failed += 1;
                    warn!(to = %to, key = %alert.target, "Alert email failed: {}", e);
                }
            }
        }

        if failed == self.recipients.len() {
            anyhow::bail!("alert email could not be delivered to any of {} recipient(s)", failed);
        }
        Ok(())
    }
}
