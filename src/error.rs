use chrono::{SecondsFormat, Utc};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

/// Error type shared by the store, broker, channel and callback clients.
///
/// Every variant maps to an HTTP-equivalent status; the worker treats 4xx as
/// permanent and everything else as transient.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<JsonValue>,
    },

    #[error("{resource} not found")]
    NotFound { resource: &'static str, id: String },

    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited { retry_after_secs: u64 },

    #[error("{service} unavailable: {message}")]
    ServiceUnavailable { service: String, message: String },

    #[error("Delivery failed: {message}")]
    Delivery { message: String, permanent: bool },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Queue topology mismatch for {queue}: {message}")]
    Topology { queue: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn validation_with(message: impl Into<String>, details: JsonValue) -> Self {
        AppError::Validation {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        AppError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn unavailable(service: impl Into<String>, message: impl ToString) -> Self {
        AppError::ServiceUnavailable {
            service: service.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => "ValidationError",
            AppError::NotFound { .. } => "NotFoundError",
            AppError::RateLimited { .. } => "RateLimitError",
            AppError::ServiceUnavailable { .. } => "ServiceUnavailableError",
            AppError::Delivery { .. } => "DeliveryError",
            AppError::Timeout { .. } => "TimeoutError",
            AppError::Database(_) => "DatabaseError",
            AppError::Broker(_) => "BrokerError",
            AppError::Topology { .. } => "TopologyError",
            AppError::Serialization(_) => "SerializationError",
            AppError::Http(_) => "HttpError",
            AppError::Internal(_) => "InternalError",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            AppError::Validation { .. } => 400,
            AppError::NotFound { .. } => 404,
            AppError::Delivery { permanent: true, .. } => 422,
            AppError::RateLimited { .. } => 429,
            AppError::Delivery { permanent: false, .. } | AppError::Http(_) => 502,
            AppError::Timeout { .. } => 504,
            AppError::ServiceUnavailable { .. }
            | AppError::Database(_)
            | AppError::Broker(_) => 503,
            AppError::Topology { .. } | AppError::Serialization(_) | AppError::Internal(_) => 500,
        }
    }

    pub fn details(&self) -> Option<JsonValue> {
        match self {
            AppError::Validation { details, .. } => details.clone(),
            AppError::NotFound { resource, id } => {
                Some(json!({ "resource": resource, "identifier": id }))
            }
            AppError::RateLimited { retry_after_secs } => {
                Some(json!({ "retryAfter": retry_after_secs }))
            }
            AppError::ServiceUnavailable { service, message } => {
                Some(json!({ "service": service, "originalError": message }))
            }
            AppError::Topology { queue, .. } => Some(json!({ "queue": queue })),
            _ => None,
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            AppError::Validation { .. } => false,
            other => !(400..500).contains(&other.http_status()),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let mut error = json!({
            "name": self.kind(),
            "message": self.to_string(),
            "statusCode": self.http_status(),
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });

        if let Some(details) = self.details() {
            error["details"] = details;
        }

        json!({ "error": error })
    }
}
