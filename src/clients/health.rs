use std::{collections::HashMap, sync::Arc};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::{
    clients::{database::NotificationStore, rbmq::RabbitMqClient},
    error::AppError,
    models::health::{LivenessResponse, QueueStats, ReadinessResponse},
};

pub struct HealthChecker {
    store: Arc<dyn NotificationStore>,
    rabbitmq: Arc<RabbitMqClient>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn NotificationStore>, rabbitmq: Arc<RabbitMqClient>) -> Self {
        Self { store, rabbitmq }
    }

    pub fn liveness(&self) -> LivenessResponse {
        LivenessResponse {
            status: "OK".to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let mut checks = HashMap::new();

        let rabbitmq = self.rabbitmq.health_check().await;
        if !rabbitmq {
            warn!("RabbitMQ readiness check failed");
        }
        checks.insert("rabbitmq".to_string(), rabbitmq);

        let database = match self.store.health_check().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Database readiness check failed");
                false
            }
        };
        checks.insert("database".to_string(), database);

        debug!(rabbitmq, database, "Readiness checked");

        ReadinessResponse::from_checks(checks)
    }

    pub async fn queue_stats(&self) -> Result<Vec<QueueStats>, AppError> {
        self.rabbitmq.queue_stats().await
    }
}
