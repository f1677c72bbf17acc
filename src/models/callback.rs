use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{notification::Notification, status::NotificationStatus};

/// Body of the outcome webhook POST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub notification_id: Uuid,
    pub status: NotificationStatus,
    pub timestamp: String,
    pub error_message: Option<String>,
}

impl CallbackPayload {
    pub fn from_notification(notification: &Notification) -> Self {
        Self {
            notification_id: notification.id,
            status: notification.status,
            timestamp: format_timestamp(notification.updated_at),
            error_message: notification.error_message.clone(),
        }
    }

    /// Sent when the full callback could not be delivered. Always reports
    /// FAILED, whatever the recorded outcome was.
    pub fn fallback(notification_id: Uuid, error_message: Option<String>) -> Self {
        Self {
            notification_id,
            status: NotificationStatus::Failed,
            timestamp: format_timestamp(Utc::now()),
            error_message,
        }
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
