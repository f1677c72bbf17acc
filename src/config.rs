use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::retry::RetryConfig;

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_email_queue")]
    pub email_queue_name: String,
    #[serde(default = "default_retry_queue")]
    pub retry_queue_name: String,
    #[serde(default = "default_dead_letter_exchange")]
    pub dead_letter_exchange: String,
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue_name: String,
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_routing_key: String,
    #[serde(default = "default_queue_message_ttl_ms")]
    pub queue_message_ttl_ms: u32,
    #[serde(default = "default_queue_max_length")]
    pub queue_max_length: u32,
    #[serde(default = "default_publish_confirm_timeout_ms")]
    pub publish_confirm_timeout_ms: u64,

    pub database_url: String,

    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_pass: String,
    pub smtp_from: Option<String>,
    #[serde(default = "default_smtp_timeout_secs")]
    pub smtp_timeout_secs: u64,

    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_retention_days")]
    pub retention_days: i32,
    #[serde(default = "default_retention_sweep_interval_secs")]
    pub retention_sweep_interval_secs: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Names and arguments of the durable queue structures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyConfig {
    pub email_queue: String,
    pub retry_queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub dead_letter_routing_key: String,
    pub message_ttl_ms: u32,
    pub max_length: u32,
    pub retry_ttl_ms: u32,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn topology(&self) -> TopologyConfig {
        TopologyConfig {
            email_queue: self.email_queue_name.clone(),
            retry_queue: self.retry_queue_name.clone(),
            dead_letter_exchange: self.dead_letter_exchange.clone(),
            dead_letter_queue: self.dead_letter_queue_name.clone(),
            dead_letter_routing_key: self.dead_letter_routing_key.clone(),
            message_ttl_ms: self.queue_message_ttl_ms,
            max_length: self.queue_max_length,
            retry_ttl_ms: u32::try_from(self.max_retry_delay_ms).unwrap_or(u32::MAX),
        }
    }

    pub fn smtp_sender(&self) -> &str {
        self.smtp_from.as_deref().unwrap_or(&self.smtp_user)
    }

    pub fn publish_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_confirm_timeout_ms)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn smtp_timeout(&self) -> Duration {
        Duration::from_secs(self.smtp_timeout_secs)
    }
}

fn default_email_queue() -> String {
    "email_queue".to_string()
}

fn default_retry_queue() -> String {
    "email_retry_queue".to_string()
}

fn default_dead_letter_exchange() -> String {
    "dlx_exchange".to_string()
}

fn default_dead_letter_queue() -> String {
    "email_dlq".to_string()
}

fn default_queue_message_ttl_ms() -> u32 {
    86_400_000
}

fn default_queue_max_length() -> u32 {
    10_000
}

fn default_publish_confirm_timeout_ms() -> u64 {
    5_000
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_timeout_secs() -> u64 {
    10
}

fn default_callback_timeout_ms() -> u64 {
    5_000
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    5_000
}

fn default_max_retry_delay_ms() -> u64 {
    60_000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_retention_days() -> i32 {
    90
}

fn default_retention_sweep_interval_secs() -> u64 {
    3_600
}

fn default_server_port() -> u16 {
    3001
}

fn default_log_format() -> String {
    "json".to_string()
}
