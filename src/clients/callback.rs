use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use reqwest::Client;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    clients::database::NotificationStore,
    error::AppError,
    models::{callback::CallbackPayload, validation::validate_url},
};

/// Best-effort webhook reporting a notification's outcome. Never returns an
/// error to the caller: a lost callback must not change how the job itself
/// is settled.
pub struct CallbackNotifier {
    http_client: Client,
    store: Arc<dyn NotificationStore>,
    timeout: Duration,
}

impl CallbackNotifier {
    pub fn new(store: Arc<dyn NotificationStore>, timeout: Duration) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mail-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        Ok(Self {
            http_client,
            store,
            timeout,
        })
    }

    /// Posts the stored record; on any failure posts a minimal FAILED payload
    /// carrying `last_error` once more, then gives up.
    pub async fn notify(
        &self,
        callback_url: &str,
        notification_id: Uuid,
        last_error: Option<&str>,
    ) {
        if let Err(e) = validate_url(callback_url, "callbackUrl") {
            warn!(notification_id = %notification_id, url = %callback_url, error = %e, "Skipping callback");
            return;
        }

        match self.store.get_by_id(notification_id).await {
            Ok(notification) => {
                let payload = CallbackPayload::from_notification(&notification);
                match self.post(callback_url, &payload).await {
                    Ok(()) => return,
                    Err(e) => warn!(
                        notification_id = %notification_id,
                        url = %callback_url,
                        error = %e,
                        "Callback failed, retrying with minimal payload"
                    ),
                }
            }
            Err(e) => warn!(
                notification_id = %notification_id,
                error = %e,
                "Could not reload notification for callback, using minimal payload"
            ),
        }

        let fallback = CallbackPayload::fallback(notification_id, last_error.map(str::to_string));

        if let Err(e) = self.post(callback_url, &fallback).await {
            error!(
                notification_id = %notification_id,
                url = %callback_url,
                error = %e,
                "Callback failed, giving up"
            );
        }
    }

    async fn post(&self, url: &str, payload: &CallbackPayload) -> Result<(), AppError> {
        let response = self
            .http_client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout {
                        operation: "Callback".to_string(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    AppError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::unavailable(
                "callback",
                format!("endpoint returned status {}", status),
            ));
        }

        info!(
            notification_id = %payload.notification_id,
            url = %url,
            status_code = status.as_u16(),
            "Callback executed successfully"
        );

        Ok(())
    }
}
