use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, time::interval};
use tracing::{error, info};

use crate::{clients::database::NotificationStore, error::AppError};

/// Deletes notifications older than `days`, returning how many were removed.
pub async fn sweep_once(store: &dyn NotificationStore, days: i32) -> Result<u64, AppError> {
    let deleted = store.delete_older_than(days).await?;

    info!(deleted, retention_days = days, "Retention sweep finished");

    Ok(deleted)
}

/// Runs [`sweep_once`] every `every` until shutdown. A zero period disables
/// the sweep.
pub async fn run(
    store: Arc<dyn NotificationStore>,
    days: i32,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if every.is_zero() {
        info!("Retention sweep disabled");
        return;
    }

    let mut ticker = interval(every);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = sweep_once(store.as_ref(), days).await {
                    error!(error = %e, "Retention sweep failed");
                }
            }
        }
    }

    info!("Retention sweep stopped");
}
