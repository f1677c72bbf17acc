use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, MultiPart},
    transport::smtp::{self, authentication::Credentials},
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{config::Config, error::AppError, models::email::Email};

/// Outbound transport for rendered messages. Sending is not idempotent: a
/// timeout may still have delivered the message.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), AppError>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let from = config.smtp_sender().parse::<Mailbox>().map_err(|e| {
            AppError::validation_with(
                format!("Invalid sender address: {}", e),
                json!({ "field": "SMTP_FROM", "value": config.smtp_sender() }),
            )
        })?;

        // 465 is implicit TLS, everything else upgrades with STARTTLS.
        let builder = if config.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        }
        .map_err(|e| AppError::unavailable("smtp", e))?;

        let transport = builder
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.smtp_user.clone(),
                config.smtp_pass.clone(),
            ))
            .timeout(Some(config.smtp_timeout()))
            .build();

        info!(host = %config.smtp_host, port = config.smtp_port, "Email service initialized");

        Ok(Self {
            transport,
            from,
            timeout: config.smtp_timeout(),
        })
    }

    fn build_message(&self, email: &Email) -> Result<Message, AppError> {
        let to = email.to.parse::<Mailbox>().map_err(|e| {
            AppError::validation_with(
                format!("Invalid recipient address: {}", e),
                json!({ "field": "to", "value": email.to }),
            )
        })?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                email.text.clone(),
                email.html.clone(),
            ))
            .map_err(|e| AppError::validation(format!("Failed to build message: {}", e)))
    }

    fn classify(&self, error: smtp::Error) -> AppError {
        if error.is_timeout() {
            return AppError::Timeout {
                operation: "SMTP send".to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            };
        }

        // 5xx replies (unknown mailbox, rejected recipient) will not change on retry.
        AppError::Delivery {
            message: error.to_string(),
            permanent: error.is_permanent(),
        }
    }
}

#[async_trait]
impl DeliveryChannel for SmtpMailer {
    async fn send(&self, email: &Email) -> Result<(), AppError> {
        let message = self.build_message(email)?;

        debug!(to = %email.to, subject = %email.subject, "Sending email");

        match self.transport.send(message).await {
            Ok(response) => {
                info!(to = %email.to, code = %response.code(), "Email accepted by SMTP server");
                Ok(())
            }
            Err(e) => {
                let error = self.classify(e);
                warn!(to = %email.to, error = %error, "Error sending email");
                Err(error)
            }
        }
    }
}
