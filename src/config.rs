//! Configuration management for the courier service.

use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use courier_delivery::{BackoffStrategy, ClientConfig, DeliveryConfig, RetryPolicy};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

const CONFIG_FILE: &str = "config.toml";

const ENV_PREFIX: &str = "COURIER_";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed `COURIER_` (highest priority)
/// 2. Plain `DATABASE_URL`
/// 3. Configuration file (`config.toml`)
/// 4. Built-in defaults (lowest priority)
///
/// Every field maps to an environment variable named after it, for example
/// `worker_count` is `COURIER_WORKER_COUNT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    pub database_min_connections: u32,
    /// Connection acquire timeout in seconds.
    pub database_acquire_timeout_seconds: u64,
    /// Connection idle timeout in seconds.
    pub database_idle_timeout_seconds: u64,
    /// Maximum lifetime of a connection in seconds.
    pub database_max_lifetime_seconds: u64,
    /// Connection attempts at startup before giving up.
    pub database_connect_attempts: u32,
    /// Pause between startup connection attempts in seconds.
    pub database_connect_retry_seconds: u64,

    // Dispatch
    /// Number of concurrent delivery workers.
    pub worker_count: usize,
    /// Maximum deliveries claimed per worker batch.
    pub batch_size: usize,
    /// Idle poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Lease added to each delivery's attempt timeout, in seconds.
    pub lease_grace_seconds: u64,
    /// First backoff after a store error, in milliseconds.
    pub store_retry_base_delay_ms: u64,
    /// Cap on store error backoff, in milliseconds.
    pub max_store_backoff_ms: u64,
    /// Local retries when recording an attempt fails transiently.
    pub max_completion_retries: u32,
    /// Time allowed for in-flight deliveries on shutdown, in seconds.
    pub shutdown_timeout_seconds: u64,

    // Retry
    /// Growth function of the delay between attempts.
    pub backoff_strategy: BackoffStrategy,
    /// Cap on the delay between attempts, in seconds.
    pub retry_max_delay_seconds: u64,

    // Client
    /// User agent sent with every webhook.
    pub user_agent: String,
    /// Redirects followed per attempt.
    pub max_redirects: u32,
    /// Whether subscriber TLS certificates are verified.
    pub verify_tls: bool,
    /// Connection establishment timeout in seconds.
    pub connect_timeout_seconds: u64,
    /// Response body bytes kept per attempt.
    pub max_response_body_bytes: usize,

    // Observability
    /// Log filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Whether the Prometheus exporter is started.
    pub metrics_enabled: bool,
    /// Address the Prometheus `/metrics` endpoint listens on.
    pub metrics_listen_addr: String,
}

impl Config {
    /// Loads configuration from defaults, `config.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or a value is invalid.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::raw().only(&["DATABASE_URL"]))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Engine configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.worker_count,
            batch_size: self.batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_grace: Duration::from_secs(self.lease_grace_seconds),
            store_retry_base_delay: Duration::from_millis(self.store_retry_base_delay_ms),
            max_store_backoff: Duration::from_millis(self.max_store_backoff_ms),
            max_completion_retries: self.max_completion_retries,
            client_config: self.to_client_config(),
            retry_policy: self.to_retry_policy(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// HTTP client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            user_agent: self.user_agent.clone(),
            max_redirects: self.max_redirects,
            verify_tls: self.verify_tls,
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            max_response_body_bytes: self.max_response_body_bytes,
        }
    }

    /// Retry policy shared by all deliveries.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_strategy, Duration::from_secs(self.retry_max_delay_seconds))
    }

    /// Parsed listen address of the metrics endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if `metrics_listen_addr` is not a socket address.
    pub fn metrics_socket_addr(&self) -> Result<SocketAddr> {
        self.metrics_listen_addr
            .parse()
            .with_context(|| format!("invalid metrics_listen_addr {:?}", self.metrics_listen_addr))
    }

    /// Database URL with the password replaced, for logging.
    pub fn database_url_masked(&self) -> String {
        match Url::parse(&self.database_url) {
            Ok(mut url) => {
                if url.password().is_some() && url.set_password(Some("***")).is_err() {
                    return "postgresql://***".to_string();
                }
                url.to_string()
            },
            Err(_) => "postgresql://***".to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database_min_connections cannot exceed database_max_connections");
        }

        if self.database_connect_attempts == 0 {
            anyhow::bail!("database_connect_attempts must be greater than 0");
        }

        if self.retry_max_delay_seconds == 0 {
            anyhow::bail!("retry_max_delay_seconds must be greater than 0");
        }

        if self.max_response_body_bytes == 0 {
            anyhow::bail!("max_response_body_bytes must be greater than 0");
        }

        if self.metrics_enabled {
            self.metrics_socket_addr()?;
        }

        self.to_delivery_config().validate().context("invalid dispatch configuration")?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let delivery = DeliveryConfig::default();
        let client = ClientConfig::default();
        let retry = RetryPolicy::default();

        Self {
            database_url: "postgresql://localhost/courier".to_string(),
            database_max_connections: 10,
            database_min_connections: 2,
            database_acquire_timeout_seconds: 10,
            database_idle_timeout_seconds: 600,
            database_max_lifetime_seconds: 1800,
            database_connect_attempts: 5,
            database_connect_retry_seconds: 2,
            worker_count: delivery.worker_count,
            batch_size: delivery.batch_size,
            poll_interval_ms: millis(delivery.poll_interval),
            lease_grace_seconds: delivery.lease_grace.as_secs(),
            store_retry_base_delay_ms: millis(delivery.store_retry_base_delay),
            max_store_backoff_ms: millis(delivery.max_store_backoff),
            max_completion_retries: delivery.max_completion_retries,
            shutdown_timeout_seconds: delivery.shutdown_timeout.as_secs(),
            backoff_strategy: retry.backoff_strategy,
            retry_max_delay_seconds: retry.max_delay.as_secs(),
            user_agent: client.user_agent,
            max_redirects: client.max_redirects,
            verify_tls: client.verify_tls,
            connect_timeout_seconds: client.connect_timeout.as_secs(),
            max_response_body_bytes: client.max_response_body_bytes,
            log_filter: "info,courier=debug".to_string(),
            metrics_enabled: true,
            metrics_listen_addr: "0.0.0.0:4001".to_string(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
