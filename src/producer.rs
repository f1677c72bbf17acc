use std::sync::Arc;

use tracing::{error, info};
use uuid::Uuid;

use crate::{
    clients::rbmq::JobPublisher,
    error::AppError,
    models::{
        job::{Job, JobData, JobType},
        validation::validate_url,
    },
};

/// Enqueues delivery jobs for notifications that already exist in the store.
/// A returned `Ok` means the broker has confirmed durable receipt.
pub struct JobProducer {
    publisher: Arc<dyn JobPublisher>,
}

impl JobProducer {
    pub fn new(publisher: Arc<dyn JobPublisher>) -> Self {
        Self { publisher }
    }

    pub async fn enqueue(&self, job_type: JobType, data: JobData) -> Result<Job, AppError> {
        let notification_id = data
            .notification_id
            .ok_or_else(|| AppError::validation("Job data is missing notificationId"))?;

        if let Some(url) = data.callback_url.as_deref() {
            validate_url(url, "callbackUrl")?;
        }

        let job = Job::new(job_type, data);

        match self.publisher.publish_job(&job).await {
            Ok(()) => {
                info!(
                    notification_id = %notification_id,
                    job_type = %job.job_type,
                    "Job enqueued"
                );
                Ok(job)
            }
            Err(e) => {
                error!(
                    notification_id = %notification_id,
                    job_type = %job.job_type,
                    error = %e,
                    "Failed to enqueue job"
                );
                Err(e)
            }
        }
    }

    pub async fn add_verification_email(
        &self,
        notification_id: Uuid,
        to: &str,
        username: &str,
        verification_link: &str,
        callback_url: Option<String>,
    ) -> Result<Job, AppError> {
        self.enqueue(
            JobType::Verification,
            JobData {
                to: Some(to.to_string()),
                username: Some(username.to_string()),
                verification_link: Some(verification_link.to_string()),
                notification_id: Some(notification_id),
                callback_url,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn add_notification_email(
        &self,
        notification_id: Uuid,
        to: &str,
        subject: &str,
        message: &str,
        callback_url: Option<String>,
    ) -> Result<Job, AppError> {
        self.enqueue(
            JobType::Notification,
            JobData {
                to: Some(to.to_string()),
                subject: Some(subject.to_string()),
                message: Some(message.to_string()),
                notification_id: Some(notification_id),
                callback_url,
                ..Default::default()
            },
        )
        .await
    }
}
