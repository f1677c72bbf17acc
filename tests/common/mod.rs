use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use mail_relay::{
    clients::{
        callback::CallbackNotifier, database::NotificationStore, rbmq::JobPublisher,
        smtp::DeliveryChannel,
    },
    config::Config,
    error::AppError,
    models::{
        email::Email,
        job::{Job, JobData, JobType},
        notification::{CreateNotification, Notification, NotificationStats},
        retry::RetryConfig,
        status::NotificationStatus,
    },
    worker::DeliveryWorker,
};
use uuid::Uuid;

/// In-memory store with the same claim semantics as the Postgres one.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<Uuid, Notification>>,
    failing: Mutex<HashSet<NotificationStatus>>,
    pub update_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every `update_status` to `status` fail with a storage error.
    pub fn fail_updates_to(&self, status: NotificationStatus) {
        self.failing.lock().unwrap().insert(status);
    }

    pub fn status_of(&self, id: Uuid) -> NotificationStatus {
        self.rows.lock().unwrap()[&id].status
    }

    pub fn snapshot(&self, id: Uuid) -> Notification {
        self.rows.lock().unwrap()[&id].clone()
    }

    pub fn backdate(&self, id: Uuid, days: i64) {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).unwrap();
        row.created_at = row.created_at - ChronoDuration::days(days);
    }

    /// Pretends the last status change happened `minutes` ago.
    pub fn stall(&self, id: Uuid, minutes: i64) {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).unwrap();
        row.updated_at = row.updated_at - ChronoDuration::minutes(minutes);
    }

    pub async fn queued(&self, to: &str) -> Uuid {
        self.create(CreateNotification::email(to).with_subject("Hello"))
            .await
            .unwrap()
            .id
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create(&self, notification: CreateNotification) -> Result<Notification, AppError> {
        let now = Utc::now();
        let created = Notification {
            id: Uuid::new_v4(),
            user_id: notification.user_id,
            notification_type: notification.notification_type,
            channel: notification.channel,
            subject: notification.subject,
            content: notification.content,
            metadata: notification.metadata,
            status: NotificationStatus::Queued,
            error_message: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
        };

        self.rows
            .lock()
            .unwrap()
            .insert(created.id, created.clone());

        Ok(created)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(&status) {
            return Err(AppError::unavailable("database", "connection refused"));
        }

        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(&id) else {
            return Ok(false);
        };

        if status == NotificationStatus::Sending && !row.status.is_claimable() {
            return Ok(false);
        }

        row.status = status;
        row.updated_at = Utc::now();
        row.error_message = match status {
            NotificationStatus::Failed => error_message.map(str::to_string),
            _ => None,
        };
        if status == NotificationStatus::Sent {
            row.sent_at = Some(Utc::now());
        }

        Ok(true)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Notification, AppError> {
        self.rows
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("Notification", id))
    }

    async fn get_by_user_id(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn get_stats_by_user_id(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<NotificationStats>, AppError> {
        let mut counts: HashMap<(String, NotificationStatus), i64> = HashMap::new();
        for n in self.rows.lock().unwrap().values() {
            if n.user_id == user_id {
                *counts
                    .entry((n.notification_type.clone(), n.status))
                    .or_default() += 1;
            }
        }

        let mut stats: Vec<_> = counts
            .into_iter()
            .map(|((notification_type, status), count)| NotificationStats {
                notification_type,
                status,
                count,
            })
            .collect();
        stats.sort_by_key(|s| (s.notification_type.clone(), s.status.id()));

        Ok(stats)
    }

    async fn get_pending(
        &self,
        limit: i64,
        stale_after: Duration,
    ) -> Result<Vec<Notification>, AppError> {
        let cutoff = Utc::now() - ChronoDuration::from_std(stale_after).unwrap();
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|n| {
                n.status.is_claimable()
                    || (n.status == NotificationStatus::Sending && n.updated_at < cutoff)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows.truncate(limit as usize);

        Ok(rows)
    }

    async fn delete_older_than(&self, days: i32) -> Result<u64, AppError> {
        let cutoff = Utc::now() - ChronoDuration::days(days as i64);
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, n| n.created_at >= cutoff);

        Ok((before - rows.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// Records every publish; can be switched to fail.
#[derive(Default)]
pub struct RecordingPublisher {
    pub jobs: Mutex<Vec<Job>>,
    pub retries: Mutex<Vec<(Job, Duration)>>,
    pub failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let publisher = Self::default();
        publisher.failing.store(true, Ordering::SeqCst);
        Arc::new(publisher)
    }

    pub fn last_retry(&self) -> Option<(Job, Duration)> {
        self.retries.lock().unwrap().last().cloned()
    }

    fn check(&self) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Timeout {
                operation: "Publish confirm".to_string(),
                timeout_ms: 5_000,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl JobPublisher for RecordingPublisher {
    async fn publish_job(&self, job: &Job) -> Result<(), AppError> {
        self.check()?;
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn publish_retry(&self, job: &Job, delay: Duration) -> Result<(), AppError> {
        self.check()?;
        self.retries.lock().unwrap().push((job.clone(), delay));
        Ok(())
    }
}

/// Delivery channel that replays scripted outcomes, then succeeds.
#[derive(Default)]
pub struct ScriptedChannel {
    script: Mutex<VecDeque<AppError>>,
    always: Mutex<Option<fn() -> AppError>>,
    pub sent: Mutex<Vec<Email>>,
    pub attempts: AtomicUsize,
}

impl ScriptedChannel {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_with(errors: Vec<AppError>) -> Arc<Self> {
        let channel = Self::default();
        *channel.script.lock().unwrap() = errors.into();
        Arc::new(channel)
    }

    pub fn always_failing(error: fn() -> AppError) -> Arc<Self> {
        let channel = Self::default();
        *channel.always.lock().unwrap() = Some(error);
        Arc::new(channel)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryChannel for ScriptedChannel {
    async fn send(&self, email: &Email) -> Result<(), AppError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = *self.always.lock().unwrap() {
            return Err(error());
        }

        if let Some(error) = self.script.lock().unwrap().pop_front() {
            return Err(error);
        }

        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

pub fn transient_error() -> AppError {
    AppError::Delivery {
        message: "421 service not available".to_string(),
        permanent: false,
    }
}

pub fn permanent_error() -> AppError {
    AppError::Delivery {
        message: "550 mailbox unavailable".to_string(),
        permanent: true,
    }
}

pub fn retry_policy() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 1_000,
        max_delay_ms: 60_000,
        backoff_multiplier: 2,
    }
}

pub fn fast_bookkeeping() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 2,
        backoff_multiplier: 2,
    }
}

pub fn build_worker(
    store: Arc<MemoryStore>,
    publisher: Arc<RecordingPublisher>,
    channel: Arc<ScriptedChannel>,
) -> DeliveryWorker {
    let callbacks = CallbackNotifier::new(store.clone(), Duration::from_millis(500)).unwrap();

    DeliveryWorker::new(store, publisher, channel, callbacks, retry_policy())
        .with_bookkeeping_retry(fast_bookkeeping())
}

pub fn notification_data(id: Uuid, callback_url: Option<String>) -> JobData {
    JobData {
        to: Some("user@example.com".to_string()),
        subject: Some("Your order shipped".to_string()),
        message: Some("It is on its way.".to_string()),
        notification_id: Some(id),
        callback_url,
        ..Default::default()
    }
}

pub fn notification_job(id: Uuid, retries: u32, callback_url: Option<String>) -> Vec<u8> {
    let mut job = Job::new(JobType::Notification, notification_data(id, callback_url));
    job.retries = retries;
    job.to_bytes().unwrap()
}

/// Config pointing at test infrastructure, with queue names unique to `tag`.
pub fn test_config(rabbitmq_url: &str, database_url: &str, tag: &str) -> Config {
    let vars = [
        ("RABBITMQ_URL", rabbitmq_url.to_string()),
        ("DATABASE_URL", database_url.to_string()),
        ("SMTP_HOST", "localhost".to_string()),
        ("SMTP_USER", "relay@example.com".to_string()),
        ("SMTP_PASS", "secret".to_string()),
        ("EMAIL_QUEUE_NAME", format!("{tag}_queue")),
        ("RETRY_QUEUE_NAME", format!("{tag}_retry")),
        ("DEAD_LETTER_EXCHANGE", format!("{tag}_dlx")),
        ("DEAD_LETTER_QUEUE_NAME", format!("{tag}_dlq")),
        ("DEAD_LETTER_ROUTING_KEY", format!("{tag}_dlq")),
        ("MAX_RETRY_DELAY_MS", "1000".to_string()),
    ];

    envy::from_iter(vars.into_iter().map(|(k, v)| (k.to_string(), v))).unwrap()
}
