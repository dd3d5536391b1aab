//! Webhook delivery engine with worker pool and at-least-once guarantees.
//!
//! The engine owns the HTTP client, the shared statistics and the worker
//! pool. Workers claim due deliveries from the store with a lease, attempt
//! them, and record the outcome guarded by the claim token.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ DeliveryEngine │──▶│ Worker Pool  │──▶│ Webhook Executor │
//! └────────────────┘   └──────────────┘   └──────────────────┘
//!                             │                     │
//!                             ▼                     ▼
//!                      ┌──────────────┐     ┌─────────────┐
//!                      │ BrokerStorage│     │ Subscriber  │
//!                      │ (claim/lease)│     │ Endpoints   │
//!                      └──────────────┘     └─────────────┘
//! ```
//!
//! - **Lock-free work distribution** using `FOR UPDATE SKIP LOCKED` with
//!   expiring leases
//! - **Configurable backoff** between attempts, exponential by default
//! - **Graceful shutdown** completes in-flight deliveries

use std::{sync::Arc, time::Duration};

use courier_core::{BrokerStorage, Clock, Storage};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::{
    client::{ClientConfig, DeliveryClient},
    error::{DeliveryError, Result},
    executor::WebhookExecutor,
    retry::RetryPolicy,
    worker::DeliveryWorker,
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum deliveries to claim per worker batch.
    pub batch_size: usize,

    /// How long an idle worker waits before polling again.
    pub poll_interval: Duration,

    /// Added to each delivery's attempt timeout to form its claim lease.
    pub lease_grace: Duration,

    /// First backoff after a failed store operation.
    pub store_retry_base_delay: Duration,

    /// Upper bound on store error backoff.
    pub max_store_backoff: Duration,

    /// Local retries of a transiently failing completion before giving the
    /// delivery back to lease expiry.
    pub max_completion_retries: u32,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff between attempts of the same delivery.
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for workers to complete on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            lease_grace: Duration::from_secs(30),
            store_retry_base_delay: Duration::from_millis(100),
            max_store_backoff: Duration::from_secs(30),
            max_completion_retries: crate::DEFAULT_COMPLETION_RETRIES,
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryConfig {
    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(DeliveryError::configuration("poll_interval must be positive"));
        }
        if self.store_retry_base_delay.is_zero() {
            return Err(DeliveryError::configuration("store_retry_base_delay must be positive"));
        }
        if self.max_store_backoff < self.store_retry_base_delay {
            return Err(DeliveryError::configuration(
                "max_store_backoff must not be shorter than store_retry_base_delay",
            ));
        }
        Ok(())
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of running delivery workers.
    pub active_workers: usize,
    /// Attempts made since startup, recorded or not.
    pub attempts_made: u64,
    /// Deliveries that reached `success`.
    pub successful_deliveries: u64,
    /// Failed attempts rescheduled for a later retry.
    pub retries_scheduled: u64,
    /// Deliveries that exhausted their attempts.
    pub permanent_failures: u64,
    /// Attempts whose claim was lost before recording.
    pub lost_claims: u64,
    /// Failed store operations while claiming or recording.
    pub store_errors: u64,
    /// Attempts currently in progress.
    pub in_flight_deliveries: u64,
}

/// Main delivery engine coordinating webhook delivery workers.
pub struct DeliveryEngine {
    instance_id: Uuid,
    storage: Arc<dyn BrokerStorage>,
    config: DeliveryConfig,
    executor: Arc<WebhookExecutor>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates a new delivery engine over any broker store.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the configuration is invalid or the
    /// HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn BrokerStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let client = DeliveryClient::new(config.client_config.clone())?;

        Ok(Self {
            instance_id: Uuid::new_v4(),
            storage,
            config,
            executor: Arc::new(WebhookExecutor::new(client)),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        })
    }

    /// Creates a delivery engine backed by PostgreSQL.
    ///
    /// # Errors
    ///
    /// See [`DeliveryEngine::new`].
    pub fn from_pool(pool: PgPool, config: DeliveryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::new(Arc::new(Storage::new(pool)), config, clock)
    }

    /// Identifier shared by this engine's worker ids.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Starts the configured worker pool.
    ///
    /// Returns immediately after spawning workers. Use `shutdown()` to stop
    /// gracefully, or drop the engine to cancel workers immediately.
    ///
    /// # Errors
    ///
    /// Returns `InternalError` if the engine is already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::internal("delivery engine already started"));
        }

        info!(
            instance_id = %self.instance_id,
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            "starting webhook delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.instance_id,
            self.storage.clone(),
            self.config.clone(),
            self.executor.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );
        worker_pool.spawn_workers().await;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Returns `true` while started workers are still running.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }

    /// Stops all workers, waiting up to `shutdown_timeout` for in-flight
    /// deliveries.
    ///
    /// Deliveries still in flight when the timeout passes keep their lease
    /// and become claimable again once it expires.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` or `WorkerPanic` from the pool.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Claims and processes exactly one batch without starting workers.
    ///
    /// Returns the number of deliveries claimed.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if claiming fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let worker = Arc::new(DeliveryWorker::new(
            WorkerPool::manual_worker_id(self.instance_id),
            self.storage.clone(),
            self.config.clone(),
            self.executor.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        ));

        worker.process_batch().await
    }
}
