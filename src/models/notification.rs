use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::status::NotificationStatus;

/// Owner of notifications raised by the system rather than a user.
pub const ANONYMOUS_USER_ID: Uuid = Uuid::nil();

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub channel: String,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub metadata: JsonValue,
    pub status: NotificationStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateNotification {
    pub user_id: Uuid,
    pub notification_type: String,
    pub channel: String,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub metadata: JsonValue,
}

impl CreateNotification {
    pub fn email(channel: impl Into<String>) -> Self {
        Self {
            user_id: ANONYMOUS_USER_ID,
            notification_type: "email".to_string(),
            channel: channel.into(),
            subject: None,
            content: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_user(mut self, user_id: Option<Uuid>) -> Self {
        self.user_id = user_id.unwrap_or(ANONYMOUS_USER_ID);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One row of the per-user `(type, status, count)` aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStats {
    #[serde(rename = "type")]
    pub notification_type: String,
    pub status: NotificationStatus,
    pub count: i64,
}
