use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
    PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        notification::{CreateNotification, Notification, NotificationStats},
        status::NotificationStatus,
    },
};

const SCHEMA: &str = include_str!("../../migrations/001_notifications.sql");

const COLUMNS: &str = r#"id, "userId", "type", channel, subject, content, metadata,
    "statusId", "errorMessage", "createdAt", "updatedAt", "sentAt""#;

/// Durable record of every notification and its delivery status.
///
/// `update_status(id, Sending, _)` is a conditional claim: it only succeeds
/// from QUEUED or RETRYING and reports whether a row changed, so at most one
/// worker can hold a notification in SENDING.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create(&self, notification: CreateNotification) -> Result<Notification, AppError>;

    async fn update_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Notification, AppError>;

    async fn get_by_user_id(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>, AppError>;

    async fn get_stats_by_user_id(&self, user_id: Uuid)
    -> Result<Vec<NotificationStats>, AppError>;

    /// Records needing operator attention, oldest first: QUEUED or RETRYING,
    /// plus SENDING claims untouched for longer than `stale_after` (a worker
    /// died between claim and ack).
    async fn get_pending(
        &self,
        limit: i64,
        stale_after: Duration,
    ) -> Result<Vec<Notification>, AppError>;

    async fn delete_older_than(&self, days: i32) -> Result<u64, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

pub struct DatabaseClient {
    pool: PgPool,
}

impl DatabaseClient {
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL database");

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to database");
                AppError::Database(e)
            })?;

        info!("PostgreSQL connection established");

        Ok(Self { pool })
    }

    /// Creates the tables and seeds the status lookup. Safe to re-run.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Database schema is up to date");
        Ok(())
    }

    fn map_row(row: &PgRow) -> Result<Notification, AppError> {
        let status_id: i32 = row.try_get("statusId")?;
        let status = NotificationStatus::from_id(status_id)
            .ok_or_else(|| AppError::Internal(format!("Unknown status id {}", status_id)))?;

        Ok(Notification {
            id: row.try_get("id")?,
            user_id: row.try_get("userId")?,
            notification_type: row.try_get("type")?,
            channel: row.try_get("channel")?,
            subject: row.try_get("subject")?,
            content: row.try_get("content")?,
            metadata: row.try_get("metadata")?,
            status,
            error_message: row.try_get("errorMessage")?,
            created_at: row.try_get("createdAt")?,
            updated_at: row.try_get("updatedAt")?,
            sent_at: row.try_get("sentAt")?,
        })
    }
}

#[async_trait]
impl NotificationStore for DatabaseClient {
    async fn create(&self, notification: CreateNotification) -> Result<Notification, AppError> {
        let query = format!(
            r#"INSERT INTO notifications ("userId", "type", channel, subject, content, metadata, "statusId")
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING {COLUMNS}"#
        );

        let row = sqlx::query(&query)
            .bind(notification.user_id)
            .bind(&notification.notification_type)
            .bind(&notification.channel)
            .bind(&notification.subject)
            .bind(&notification.content)
            .bind(&notification.metadata)
            .bind(NotificationStatus::Queued.id())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Error creating notification record");
                AppError::Database(e)
            })?;

        let created = Self::map_row(&row)?;

        info!(
            notification_id = %created.id,
            notification_type = %created.notification_type,
            "Notification record created"
        );

        Ok(created)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError> {
        let query = match status {
            NotificationStatus::Sending => sqlx::query(
                r#"UPDATE notifications
                   SET "statusId" = $2, "errorMessage" = NULL, "updatedAt" = NOW()
                   WHERE id = $1 AND "statusId" IN ($3, $4)"#,
            )
            .bind(id)
            .bind(status.id())
            .bind(NotificationStatus::Queued.id())
            .bind(NotificationStatus::Retrying.id()),
            NotificationStatus::Failed => sqlx::query(
                r#"UPDATE notifications
                   SET "statusId" = $2, "errorMessage" = $3, "updatedAt" = NOW()
                   WHERE id = $1"#,
            )
            .bind(id)
            .bind(status.id())
            .bind(error_message),
            NotificationStatus::Sent => sqlx::query(
                r#"UPDATE notifications
                   SET "statusId" = $2, "errorMessage" = NULL, "updatedAt" = NOW(), "sentAt" = NOW()
                   WHERE id = $1"#,
            )
            .bind(id)
            .bind(status.id()),
            NotificationStatus::Queued | NotificationStatus::Retrying => sqlx::query(
                r#"UPDATE notifications
                   SET "statusId" = $2, "errorMessage" = NULL, "updatedAt" = NOW()
                   WHERE id = $1"#,
            )
            .bind(id)
            .bind(status.id()),
        };

        let result = query.execute(&self.pool).await.map_err(|e| {
            error!(
                notification_id = %id,
                status = %status,
                error = %e,
                "Error updating notification status"
            );
            AppError::Database(e)
        })?;

        let changed = result.rows_affected() > 0;

        debug!(
            notification_id = %id,
            status = %status,
            changed,
            has_error = error_message.is_some(),
            "Notification status updated"
        );

        Ok(changed)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Notification, AppError> {
        let query = format!("SELECT {COLUMNS} FROM notifications WHERE id = $1");

        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::map_row(&row),
            None => Err(AppError::not_found("Notification", id)),
        }
    }

    async fn get_by_user_id(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let query = format!(
            r#"SELECT {COLUMNS} FROM notifications
               WHERE "userId" = $1
               ORDER BY "createdAt" DESC
               LIMIT $2 OFFSET $3"#
        );

        sqlx::query(&query)
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(Self::map_row)
            .collect()
    }

    async fn get_stats_by_user_id(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<NotificationStats>, AppError> {
        let rows = sqlx::query(
            r#"SELECT "type", "statusId", COUNT(*) AS count
               FROM notifications
               WHERE "userId" = $1
               GROUP BY "type", "statusId"
               ORDER BY "type", "statusId""#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<NotificationStats, AppError> {
                let status_id: i32 = row.try_get("statusId")?;
                let status = NotificationStatus::from_id(status_id).ok_or_else(|| {
                    AppError::Internal(format!("Unknown status id {}", status_id))
                })?;

                Ok(NotificationStats {
                    notification_type: row.try_get("type")?,
                    status,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    async fn get_pending(
        &self,
        limit: i64,
        stale_after: Duration,
    ) -> Result<Vec<Notification>, AppError> {
        let query = format!(
            r#"SELECT {COLUMNS} FROM notifications
               WHERE "statusId" IN ($1, $2)
                  OR ("statusId" = $3 AND "updatedAt" < NOW() - MAKE_INTERVAL(secs => $4))
               ORDER BY "createdAt" ASC
               LIMIT $5"#
        );

        sqlx::query(&query)
            .bind(NotificationStatus::Queued.id())
            .bind(NotificationStatus::Retrying.id())
            .bind(NotificationStatus::Sending.id())
            .bind(stale_after.as_secs_f64())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(Self::map_row)
            .collect()
    }

    async fn delete_older_than(&self, days: i32) -> Result<u64, AppError> {
        let deleted = sqlx::query(
            r#"DELETE FROM notifications
               WHERE "createdAt" < NOW() - MAKE_INTERVAL(days => $1)"#,
        )
        .bind(days)
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!(days, deleted, "Old notifications deleted");

        Ok(deleted)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::unavailable("database", e))?;

        Ok(())
    }
}
