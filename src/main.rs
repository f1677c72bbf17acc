use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use mail_relay::{
    api::run_api_server,
    clients::{
        callback::CallbackNotifier,
        database::{DatabaseClient, NotificationStore},
        health::HealthChecker,
        rbmq::{JobPublisher, RabbitMqClient},
        smtp::{DeliveryChannel, SmtpMailer},
    },
    config::Config,
    models::retry::RetryConfig,
    retention,
    utils::{init_tracing, retry_with_backoff},
    worker::DeliveryWorker,
};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;

    init_tracing(&config.log_format)?;

    let _ = rustls::crypto::ring::default_provider().install_default();

    let startup_retry = RetryConfig {
        max_attempts: 10,
        initial_delay_ms: 1_000,
        max_delay_ms: 10_000,
        backoff_multiplier: 2,
    };

    let database = retry_with_backoff(&startup_retry, || {
        DatabaseClient::connect(&config.database_url)
    })
    .await
    .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

    database
        .migrate()
        .await
        .map_err(|e| anyhow!("Failed to run migrations: {}", e))?;

    let store: Arc<dyn NotificationStore> = Arc::new(database);

    let rabbitmq = Arc::new(
        retry_with_backoff(&startup_retry, || RabbitMqClient::connect(&config))
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?,
    );

    rabbitmq
        .declare_topology()
        .await
        .map_err(|e| anyhow!("Failed to declare queue topology: {}", e))?;

    let mailer: Arc<dyn DeliveryChannel> = Arc::new(
        SmtpMailer::new(&config).map_err(|e| anyhow!("Failed to initialise SMTP: {}", e))?,
    );

    let callbacks = CallbackNotifier::new(Arc::clone(&store), config.callback_timeout())?;

    let publisher: Arc<dyn JobPublisher> = rabbitmq.clone();

    let worker = DeliveryWorker::new(
        Arc::clone(&store),
        publisher,
        mailer,
        callbacks,
        config.retry_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_checker = HealthChecker::new(Arc::clone(&store), Arc::clone(&rabbitmq));
    let api_shutdown = shutdown_rx.clone();
    let server_port = config.server_port;
    let api_handle = tokio::spawn(async move {
        if let Err(e) = run_api_server(server_port, health_checker, api_shutdown).await {
            error!(error = %e, "Health check server failed");
        }
    });

    let retention_handle = tokio::spawn(retention::run(
        Arc::clone(&store),
        config.retention_days,
        Duration::from_secs(config.retention_sweep_interval_secs),
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    info!(
        queue = %rabbitmq.topology().email_queue,
        max_retries = config.max_retry_attempts,
        "Email worker is ready"
    );

    worker.run(&rabbitmq, shutdown_rx).await;

    rabbitmq.close().await;

    let _ = api_handle.await;
    let _ = retention_handle.await;

    info!("Worker shut down cleanly");

    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
