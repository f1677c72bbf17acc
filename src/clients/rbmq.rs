use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, TopologyConfig},
    error::AppError,
    models::{health::QueueStats, job::Job},
};

/// One in-flight delivery per worker instance.
pub const PREFETCH_COUNT: u16 = 1;

const CONSUMER_TAG: &str = "mail_relay_worker";

/// Publishes jobs on a publisher-confirm channel. Both methods return only
/// after the broker has acknowledged durable receipt.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish_job(&self, job: &Job) -> Result<(), AppError>;

    /// Parks the job on the retry queue; the broker moves it back to the main
    /// queue once `delay` has elapsed.
    ///
    /// Expiry is only checked at the head of the queue, so a message with a
    /// long delay holds back shorter ones queued behind it. `delay` is never
    /// above the queue's `x-message-ttl`.
    async fn publish_retry(&self, job: &Job, delay: Duration) -> Result<(), AppError>;
}

struct Session {
    connection: Connection,
    consume_channel: Channel,
    confirm_channel: Channel,
}

impl Session {
    fn is_usable(&self) -> bool {
        self.connection.status().connected()
            && self.consume_channel.status().connected()
            && self.confirm_channel.status().connected()
    }
}

/// Process-wide broker handle. Connects lazily and re-establishes the
/// connection on the next use after it has been lost.
pub struct RabbitMqClient {
    url: String,
    topology: TopologyConfig,
    confirm_timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl RabbitMqClient {
    pub fn new(config: &Config) -> Self {
        Self {
            url: config.rabbitmq_url.clone(),
            topology: config.topology(),
            confirm_timeout: config.publish_confirm_timeout(),
            session: Mutex::new(None),
        }
    }

    pub async fn connect(config: &Config) -> Result<Self, AppError> {
        let client = Self::new(config);
        client.confirm_channel().await?;
        Ok(client)
    }

    pub fn topology(&self) -> &TopologyConfig {
        &self.topology
    }

    async fn open_session(&self) -> Result<Session, AppError> {
        info!("Connecting to RabbitMQ...");

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to RabbitMQ");
                AppError::Broker(e)
            })?;

        let consume_channel = connection.create_channel().await?;
        consume_channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await?;

        let confirm_channel = connection.create_channel().await?;
        confirm_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!("RabbitMQ connection established");

        Ok(Session {
            connection,
            consume_channel,
            confirm_channel,
        })
    }

    async fn channels(&self) -> Result<(Channel, Channel), AppError> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_ref() {
            if session.is_usable() {
                return Ok((
                    session.consume_channel.clone(),
                    session.confirm_channel.clone(),
                ));
            }
            warn!("RabbitMQ session is no longer usable, reconnecting");
        }

        let session = self.open_session().await?;
        let channels = (
            session.consume_channel.clone(),
            session.confirm_channel.clone(),
        );
        *guard = Some(session);

        Ok(channels)
    }

    async fn consume_channel(&self) -> Result<Channel, AppError> {
        Ok(self.channels().await?.0)
    }

    async fn confirm_channel(&self) -> Result<Channel, AppError> {
        Ok(self.channels().await?.1)
    }

    /// Short-lived channel for operations that close their channel on
    /// failure (declarations, passive checks).
    async fn scratch_channel(&self) -> Result<Channel, AppError> {
        self.channels().await?;

        let guard = self.session.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| AppError::unavailable("rabbitmq", "no active session"))?;

        Ok(session.connection.create_channel().await?)
    }

    /// Declares the exchange, queues and binding. Re-running with identical
    /// arguments is a no-op; a mismatch with what the broker already has is
    /// reported as a topology error.
    pub async fn declare_topology(&self) -> Result<(), AppError> {
        let channel = self.scratch_channel().await?;
        let topology = &self.topology;

        let drift = |queue: &str| {
            let queue = queue.to_string();
            move |e: lapin::Error| {
                error!(queue = %queue, error = %e, "Queue declaration rejected by broker");
                AppError::Topology {
                    queue,
                    message: e.to_string(),
                }
            }
        };

        channel
            .exchange_declare(
                &topology.dead_letter_exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(drift(&topology.dead_letter_exchange))?;

        channel
            .queue_declare(
                &topology.dead_letter_queue,
                durable(),
                FieldTable::default(),
            )
            .await
            .map_err(drift(&topology.dead_letter_queue))?;

        channel
            .queue_bind(
                &topology.dead_letter_queue,
                &topology.dead_letter_exchange,
                &topology.dead_letter_routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(drift(&topology.dead_letter_queue))?;

        channel
            .queue_declare(
                &topology.email_queue,
                durable(),
                main_queue_arguments(topology),
            )
            .await
            .map_err(drift(&topology.email_queue))?;

        channel
            .queue_declare(
                &topology.retry_queue,
                durable(),
                retry_queue_arguments(topology),
            )
            .await
            .map_err(drift(&topology.retry_queue))?;

        if let Err(e) = channel.close(200, "topology declared").await {
            debug!(error = %e, "Failed to close declaration channel");
        }

        info!(
            queue = %topology.email_queue,
            retry_queue = %topology.retry_queue,
            dlx = %topology.dead_letter_exchange,
            dlq = %topology.dead_letter_queue,
            "Queue topology declared"
        );

        Ok(())
    }

    pub async fn create_consumer(&self) -> Result<Consumer, AppError> {
        let consumer = self
            .consume_channel()
            .await?
            .basic_consume(
                &self.topology.email_queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = %self.topology.email_queue, "Consumer created for queue");

        Ok(consumer)
    }

    async fn publish_confirmed(
        &self,
        queue: &str,
        job: &Job,
        properties: BasicProperties,
    ) -> Result<(), AppError> {
        let payload = job.to_bytes()?;
        let channel = self.confirm_channel().await?;

        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &payload,
                properties,
            )
            .await?;

        let confirmation = timeout(self.confirm_timeout, confirm)
            .await
            .map_err(|_| AppError::Timeout {
                operation: format!("Publish confirm for {}", queue),
                timeout_ms: self.confirm_timeout.as_millis() as u64,
            })??;

        match confirmation {
            Confirmation::Ack(None) => Ok(()),
            Confirmation::Ack(Some(_)) => Err(AppError::unavailable(
                "rabbitmq",
                format!("message returned as unroutable by queue {}", queue),
            )),
            Confirmation::Nack(_) => Err(AppError::unavailable(
                "rabbitmq",
                format!("broker refused message for queue {}", queue),
            )),
            Confirmation::NotRequested => Err(AppError::Internal(
                "publish channel is not in confirm mode".to_string(),
            )),
        }
    }

    pub async fn queue_stats(&self) -> Result<Vec<QueueStats>, AppError> {
        let channel = self.scratch_channel().await?;
        let mut stats = Vec::with_capacity(3);

        for name in [
            &self.topology.email_queue,
            &self.topology.retry_queue,
            &self.topology.dead_letter_queue,
        ] {
            let queue = channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;

            stats.push(QueueStats {
                queue: name.clone(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            });
        }

        if let Err(e) = channel.close(200, "stats collected").await {
            debug!(error = %e, "Failed to close stats channel");
        }

        Ok(stats)
    }

    pub async fn health_check(&self) -> bool {
        let guard = self.session.lock().await;
        guard.as_ref().is_some_and(Session::is_usable)
    }

    pub async fn close(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };

        if let Err(e) = session.connection.close(200, "worker shutting down").await {
            warn!(error = %e, "Error closing RabbitMQ connection");
        } else {
            info!("RabbitMQ connection closed gracefully");
        }
    }
}

#[async_trait]
impl JobPublisher for RabbitMqClient {
    async fn publish_job(&self, job: &Job) -> Result<(), AppError> {
        self.publish_confirmed(&self.topology.email_queue, job, persistent_json())
            .await?;

        debug!(
            job_type = %job.job_type,
            queue = %self.topology.email_queue,
            "Job confirmed by broker"
        );

        Ok(())
    }

    async fn publish_retry(&self, job: &Job, delay: Duration) -> Result<(), AppError> {
        let properties =
            persistent_json().with_expiration(ShortString::from(delay.as_millis().to_string()));

        self.publish_confirmed(&self.topology.retry_queue, job, properties)
            .await?;

        debug!(
            job_type = %job.job_type,
            retries = job.retries,
            delay_ms = delay.as_millis() as u64,
            "Job parked on retry queue"
        );

        Ok(())
    }
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn persistent_json() -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(2)
        .with_content_type(ShortString::from("application/json"))
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(value.to_string().into())
}

pub fn main_queue_arguments(topology: &TopologyConfig) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt(i64::from(topology.message_ttl_ms)),
    );
    args.insert(
        "x-max-length".into(),
        AMQPValue::LongLongInt(i64::from(topology.max_length)),
    );
    args.insert(
        "x-dead-letter-exchange".into(),
        long_string(&topology.dead_letter_exchange),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        long_string(&topology.dead_letter_routing_key),
    );
    args
}

/// Expired messages are dead-lettered through the default exchange straight
/// back onto the main queue.
pub fn retry_queue_arguments(topology: &TopologyConfig) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt(i64::from(topology.retry_ttl_ms)),
    );
    args.insert("x-dead-letter-exchange".into(), long_string(""));
    args.insert(
        "x-dead-letter-routing-key".into(),
        long_string(&topology.email_queue),
    );
    args
}
