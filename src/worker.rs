//! Delivery worker: consumes one job at a time, claims its notification,
//! sends it, and settles the message according to the outcome.
//!
//! Notification lifecycle driven from here:
//!
//! ```text
//! QUEUED ──claim──▶ SENDING ──ok──▶ SENT
//!                     │  ▲
//!          retriable  │  │ claim after retry delay
//!                     ▼  │
//!                   RETRYING
//!
//! SENDING ──permanent / exhausted──▶ FAILED
//! ```

use std::sync::Arc;

use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
};
use tokio::{sync::watch, time::sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::{
        callback::CallbackNotifier, database::NotificationStore, rbmq::JobPublisher,
        rbmq::RabbitMqClient, smtp::DeliveryChannel, template::TemplateRenderer,
    },
    error::AppError,
    models::{
        email::Email,
        job::{Job, JobType},
        retry::RetryConfig,
        status::NotificationStatus,
        validation::{require, validate_email},
    },
    utils::retry_with_backoff,
};

/// How the broker message should be settled once processing is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove from the queue.
    Ack,
    /// Nack without requeue; the broker routes it to the dead-letter queue.
    DeadLetter,
    /// Nack with requeue; the broker redelivers it.
    Requeue,
}

pub struct DeliveryWorker {
    store: Arc<dyn NotificationStore>,
    publisher: Arc<dyn JobPublisher>,
    channel: Arc<dyn DeliveryChannel>,
    callbacks: CallbackNotifier,
    templates: TemplateRenderer,
    retry_config: RetryConfig,
    bookkeeping_retry: RetryConfig,
    reconnect_backoff: RetryConfig,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        publisher: Arc<dyn JobPublisher>,
        channel: Arc<dyn DeliveryChannel>,
        callbacks: CallbackNotifier,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            channel,
            callbacks,
            templates: TemplateRenderer::new(),
            retry_config,
            bookkeeping_retry: RetryConfig::bookkeeping(),
            reconnect_backoff: RetryConfig {
                max_attempts: u32::MAX,
                initial_delay_ms: 1_000,
                max_delay_ms: 30_000,
                backoff_multiplier: 2,
            },
        }
    }

    pub fn with_bookkeeping_retry(mut self, config: RetryConfig) -> Self {
        self.bookkeeping_retry = config;
        self
    }

    /// Runs one message through parse, claim, send and settle. Never fails:
    /// every error is turned into a disposition.
    pub async fn process_message(&self, payload: &[u8]) -> Disposition {
        let (job, notification_id) = match Job::parse(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Dropping malformed job");
                return Disposition::Ack;
            }
        };

        info!(
            notification_id = %notification_id,
            job_type = %job.job_type,
            retries = job.retries,
            "Processing job"
        );

        match self
            .store
            .update_status(notification_id, NotificationStatus::Sending, None)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    notification_id = %notification_id,
                    "Notification already claimed or finished, dropping stale job"
                );
                return Disposition::Ack;
            }
            Err(e) => {
                error!(
                    notification_id = %notification_id,
                    error = %e,
                    "Failed to claim notification, returning job to queue"
                );
                return Disposition::Requeue;
            }
        }

        match self.execute(&job).await {
            Ok(()) => self.on_success(&job, notification_id).await,
            Err(e) => self.on_failure(&job, notification_id, e).await,
        }
    }

    async fn execute(&self, job: &Job) -> Result<(), AppError> {
        let kind = job
            .kind()
            .ok_or_else(|| AppError::validation(format!("Unknown job type: {}", job.job_type)))?;

        let to = require(job.data.to.as_deref(), "to")?;
        validate_email(to, "to")?;

        let content = match kind {
            JobType::Verification => {
                let username = require(job.data.username.as_deref(), "username")?;
                let link = require(job.data.verification_link.as_deref(), "verificationLink")?;
                self.templates.render_verification(username, link)?
            }
            JobType::Notification => {
                let subject = require(job.data.subject.as_deref(), "subject")?;
                let message = require(job.data.message.as_deref(), "message")?;
                self.templates.render_plain(subject, message)
            }
        };

        self.channel
            .send(&Email {
                to: to.to_string(),
                subject: content.subject,
                text: content.text,
                html: content.html,
            })
            .await
    }

    async fn on_success(&self, job: &Job, notification_id: Uuid) -> Disposition {
        let recorded = retry_with_backoff(&self.bookkeeping_retry, || {
            self.store
                .update_status(notification_id, NotificationStatus::Sent, None)
        })
        .await;

        match recorded {
            Ok(_) => info!(
                notification_id = %notification_id,
                job_type = %job.job_type,
                retries = job.retries,
                "Notification sent successfully"
            ),
            // No resend: the channel is not idempotent.
            Err(e) => error!(
                notification_id = %notification_id,
                error = %e,
                "Notification delivered but SENT status could not be recorded"
            ),
        }

        self.notify(job, notification_id, None).await;

        Disposition::Ack
    }

    async fn on_failure(&self, job: &Job, notification_id: Uuid, error: AppError) -> Disposition {
        let message = error.to_string();

        if !error.is_retriable() {
            warn!(
                notification_id = %notification_id,
                error = %message,
                kind = error.kind(),
                "Permanent delivery failure"
            );
            return self.dead_letter(job, notification_id, &message).await;
        }

        if !self.retry_config.has_attempts_left(job.retries) {
            warn!(
                notification_id = %notification_id,
                retries = job.retries,
                max_retries = self.retry_config.max_attempts,
                error = %message,
                "Max retries reached"
            );
            return self.dead_letter(job, notification_id, &message).await;
        }

        let marked = retry_with_backoff(&self.bookkeeping_retry, || {
            self.store
                .update_status(notification_id, NotificationStatus::Retrying, None)
        })
        .await;

        if let Err(e) = marked {
            error!(
                notification_id = %notification_id,
                error = %e,
                "Could not record RETRYING status, dead-lettering job"
            );
            return self.dead_letter(job, notification_id, &message).await;
        }

        let next = job.next_attempt();
        let delay = self.retry_config.delay_for(job.retries);

        if let Err(e) = self.publisher.publish_retry(&next, delay).await {
            error!(
                notification_id = %notification_id,
                error = %e,
                "Failed to publish retry, dead-lettering job"
            );
            let message = format!("{}; retry could not be scheduled: {}", message, e);
            return self.dead_letter(job, notification_id, &message).await;
        }

        info!(
            notification_id = %notification_id,
            attempt = next.retries,
            max_retries = self.retry_config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "Delivery failed, retry scheduled"
        );

        self.notify(job, notification_id, Some(&message)).await;

        Disposition::Ack
    }

    async fn dead_letter(&self, job: &Job, notification_id: Uuid, message: &str) -> Disposition {
        let recorded = retry_with_backoff(&self.bookkeeping_retry, || {
            self.store
                .update_status(notification_id, NotificationStatus::Failed, Some(message))
        })
        .await;

        if let Err(e) = recorded {
            error!(
                notification_id = %notification_id,
                error = %e,
                "Could not record FAILED status"
            );
        }

        error!(
            notification_id = %notification_id,
            job_type = %job.job_type,
            retries = job.retries,
            error = %message,
            "Job failed permanently, moving to dead-letter queue"
        );

        self.notify(job, notification_id, Some(message)).await;

        Disposition::DeadLetter
    }

    async fn notify(&self, job: &Job, notification_id: Uuid, last_error: Option<&str>) {
        if let Some(url) = job.data.callback_url.as_deref() {
            self.callbacks.notify(url, notification_id, last_error).await;
        }
    }

    /// Consumes until `shutdown` flips. A lost broker session is re-opened on
    /// demand with capped exponential backoff; the message being processed
    /// when shutdown is requested is always settled first.
    pub async fn run(&self, rabbitmq: &RabbitMqClient, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;

        info!("Email worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match rabbitmq.create_consumer().await {
                Ok(mut consumer) => {
                    failures = 0;

                    loop {
                        let next = tokio::select! {
                            _ = shutdown.changed() => {
                                info!("Shutdown requested, stopping consumer");
                                return;
                            }
                            next = consumer.next() => next,
                        };

                        match next {
                            Some(Ok(delivery)) => self.handle_delivery(delivery).await,
                            Some(Err(e)) => {
                                error!(error = %e, "Consumer stream failed, reconnecting");
                                break;
                            }
                            None => {
                                warn!("Consumer stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, attempt = failures + 1, "Failed to start consumer");
                }
            }

            let delay = self.reconnect_backoff.delay_for(failures);
            failures = failures.saturating_add(1);

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(delay) => {}
            }
        }

        info!("Email worker stopped");
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let disposition = self.process_message(&delivery.data).await;

        let settled = match disposition {
            Disposition::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
            Disposition::DeadLetter => {
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
            }
            Disposition::Requeue => {
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
        };

        match settled {
            Ok(_) => debug!(delivery_tag, ?disposition, "Delivery settled"),
            Err(e) => error!(
                delivery_tag,
                ?disposition,
                error = %e,
                "Failed to settle delivery, broker will redeliver"
            ),
        }
    }
}
