//! Courier webhook delivery broker.
//!
//! Main entry point for the courier service. Initializes all subsystems,
//! runs the delivery engine and coordinates graceful shutdown.

mod config;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{storage::schema, RealClock};
use courier_delivery::DeliveryEngine;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log_filter)?;
    if config.metrics_enabled {
        init_metrics(config.metrics_socket_addr()?)?;
    }

    info!("starting courier webhook delivery broker");
    info!(
        database_url = %config.database_url_masked(),
        worker_count = config.worker_count,
        batch_size = config.batch_size,
        max_connections = config.database_max_connections,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    schema::migrate(&db_pool).await.context("failed to apply database schema")?;
    info!("database schema is up to date");

    let clock = Arc::new(RealClock::new());
    let mut engine = DeliveryEngine::from_pool(db_pool.clone(), config.to_delivery_config(), clock)
        .context("failed to create delivery engine")?;
    engine.start().await.context("failed to start delivery engine")?;
    info!(instance_id = %engine.instance_id(), "courier is dispatching deliveries");

    shutdown_signal().await?;
    info!("shutdown signal received, starting graceful shutdown");

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine did not shut down cleanly");
    }

    db_pool.close().await;
    info!("database connections closed");

    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing from `RUST_LOG`, falling back to `default_filter`.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Installs the Prometheus recorder and serves `/metrics` on `addr`.
fn init_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    info!(%addr, "prometheus metrics exporter listening");
    Ok(())
}

/// Creates the database connection pool, retrying the initial connection.
async fn create_database_pool(config: &Config) -> Result<PgPool> {
    let retry_delay = Duration::from_secs(config.database_connect_retry_seconds);
    let mut attempt = 1;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_acquire_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime_seconds))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if attempt < config.database_connect_attempts => {
                warn!(
                    attempt,
                    max_attempts = config.database_connect_attempts,
                    error = %e,
                    "database connection failed, retrying"
                );
                attempt += 1;
                tokio::time::sleep(retry_delay).await;
            },
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "failed to connect to database after {} attempts",
                        config.database_connect_attempts
                    )
                });
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;

        tokio::select! {
            result = ctrl_c => {
                result.context("failed to listen for Ctrl+C")?;
                info!("received CTRL+C signal");
            },
            _ = terminate.recv() => {
                info!("received SIGTERM signal");
            },
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to listen for Ctrl+C")?;
        info!("received CTRL+C signal");
    }

    Ok(())
}
