use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

/// Lifecycle status of a notification. The integer ids are stored in the
/// `notification_statuses` lookup table and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Queued,
    Sending,
    Sent,
    Failed,
    Retrying,
}

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 5] = [
        NotificationStatus::Queued,
        NotificationStatus::Sending,
        NotificationStatus::Sent,
        NotificationStatus::Failed,
        NotificationStatus::Retrying,
    ];

    pub fn id(self) -> i32 {
        match self {
            NotificationStatus::Queued => 1,
            NotificationStatus::Sending => 2,
            NotificationStatus::Sent => 3,
            NotificationStatus::Failed => 4,
            NotificationStatus::Retrying => 5,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Queued => "QUEUED",
            NotificationStatus::Sending => "SENDING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Failed => "FAILED",
            NotificationStatus::Retrying => "RETRYING",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Failed)
    }

    /// States a worker may claim from.
    pub fn is_claimable(self) -> bool {
        matches!(self, NotificationStatus::Queued | NotificationStatus::Retrying)
    }

    /// Edges of the delivery state machine.
    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;

        matches!(
            (self, next),
            (Queued, Sending)
                | (Retrying, Sending)
                | (Sending, Sent)
                | (Sending, Retrying)
                | (Sending, Failed)
        )
    }
}

impl Display for NotificationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}
