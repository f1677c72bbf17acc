use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    Verification,
    Notification,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Verification => "verification",
            JobType::Notification => "notification",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "verification" => Some(JobType::Verification),
            "notification" => Some(JobType::Notification),
            _ => None,
        }
    }
}

/// Delivery parameters carried by a job. Only `notification_id` is needed to
/// accept the job; the rest is validated per job type at execution time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    #[serde(default, alias = "email", skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_link: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    pub notification_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// Wire format of a queued job: `{type, data, timestamp, retries}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: JobData,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub retries: u32,
}

impl Job {
    pub fn new(job_type: JobType, data: JobData) -> Self {
        Self {
            job_type: job_type.as_str().to_string(),
            data,
            timestamp: Utc::now().timestamp_millis(),
            retries: 0,
        }
    }

    /// Parses a delivery body. Malformed JSON and a missing notification id
    /// are both rejected; the job type is checked later.
    pub fn parse(payload: &[u8]) -> Result<(Self, Uuid), AppError> {
        let job = serde_json::from_slice::<Job>(payload)
            .map_err(|e| AppError::validation(format!("Malformed job payload: {}", e)))?;

        let notification_id = job
            .data
            .notification_id
            .ok_or_else(|| AppError::validation("Job payload is missing notificationId"))?;

        Ok((job, notification_id))
    }

    pub fn kind(&self) -> Option<JobType> {
        JobType::parse(&self.job_type)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AppError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Copy of this job for the next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            retries: self.retries + 1,
            ..self.clone()
        }
    }
}
