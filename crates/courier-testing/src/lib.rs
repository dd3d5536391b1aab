//! Test harness for courier integration and unit tests.
//!
//! Provides a deterministic broker environment (in-memory store, manually
//! advanced clock, wiremock endpoint), PostgreSQL test databases, fixture
//! builders and invariant checks.

pub mod database;
pub mod fixtures;
pub mod http;
pub mod invariants;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use courier_core::{
    Broker, BrokerStorage, Delivery, DeliveryAttempt, DeliveryAttemptFilter, DeliveryId,
    ListOptions, MemoryStorage, Subscription, TestClock, Topic, TopicParams,
};
use courier_delivery::{ClientConfig, DeliveryConfig, DeliveryEngine};
pub use database::TestDatabase;
pub use fixtures::SubscriptionBuilder;
pub use invariants::Invariants;
use tracing_subscriber::EnvFilter;
use wiremock::MockServer;

/// Upper bound on batches drained by [`TestEnv::drain`] before giving up.
const MAX_DRAIN_BATCHES: usize = 1_000;

/// Initializes tracing once for the test binary.
///
/// Honors `RUST_LOG`; defaults to warnings plus courier debug output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,courier=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Test environment with all necessary infrastructure.
pub struct TestEnv {
    /// Store behind the broker and engines.
    pub storage: Arc<dyn BrokerStorage>,
    /// In-memory store handle for failure injection; `None` on PostgreSQL.
    pub memory: Option<Arc<MemoryStorage>>,
    /// Manually advanced clock shared by broker and engines.
    pub clock: TestClock,
    /// Broker facade over `storage`.
    pub broker: Broker,
    /// Subscriber endpoint.
    pub http_mock: MockServer,
}

impl TestEnv {
    /// Creates an environment over a fresh in-memory store.
    pub async fn new() -> Result<Self> {
        let memory = Arc::new(MemoryStorage::new());
        let mut env = Self::with_storage(memory.clone()).await;
        env.memory = Some(memory);
        Ok(env)
    }

    /// Creates an environment over any store, such as a [`TestDatabase`].
    pub async fn with_storage(storage: Arc<dyn BrokerStorage>) -> Self {
        init_tracing();

        // Whole-second start keeps timestamps exact through PostgreSQL's
        // microsecond precision.
        let start = DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_default();
        let clock = TestClock::with_start_time(start);
        let broker = Broker::new(storage.clone(), Arc::new(clock.clone()));
        let http_mock = MockServer::start().await;

        Self { storage, memory: None, clock, broker, http_mock }
    }

    /// Returns the in-memory store.
    pub fn memory(&self) -> Result<&Arc<MemoryStorage>> {
        self.memory.as_ref().context("environment is not backed by the in-memory store")
    }

    /// Advances test time by the specified duration.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Absolute URL of `path` on the mock endpoint.
    pub fn webhook_url(&self, path: &str) -> String {
        format!("{}{path}", self.http_mock.uri())
    }

    /// Delivery configuration suited to tests: one worker, short intervals.
    pub fn delivery_config() -> DeliveryConfig {
        DeliveryConfig {
            worker_count: 1,
            batch_size: 10,
            poll_interval: Duration::from_millis(10),
            lease_grace: Duration::from_secs(1),
            store_retry_base_delay: Duration::from_millis(5),
            max_store_backoff: Duration::from_millis(50),
            max_completion_retries: 3,
            client_config: ClientConfig {
                connect_timeout: Duration::from_secs(2),
                ..ClientConfig::default()
            },
            shutdown_timeout: Duration::from_secs(5),
            ..DeliveryConfig::default()
        }
    }

    /// Builds an engine over this environment's store and clock.
    pub fn engine(&self, config: DeliveryConfig) -> Result<DeliveryEngine> {
        DeliveryEngine::new(self.storage.clone(), config, Arc::new(self.clock.clone()))
            .context("failed to create delivery engine")
    }

    /// Creates a topic with a generated id.
    pub async fn create_topic(&self, name: &str) -> Result<Topic> {
        self.broker.create_topic(TopicParams::new(name)).await.context("failed to create topic")
    }

    /// Creates a subscription from a builder.
    pub async fn create_subscription(&self, builder: SubscriptionBuilder) -> Result<Subscription> {
        self.broker
            .create_subscription(builder.build())
            .await
            .context("failed to create subscription")
    }

    /// Processes batches until nothing is due at the current test time.
    ///
    /// Returns the total number of deliveries claimed.
    pub async fn drain(&self, engine: &DeliveryEngine) -> Result<usize> {
        let mut total = 0;
        for _ in 0..MAX_DRAIN_BATCHES {
            let claimed = engine.process_batch().await.context("batch processing failed")?;
            if claimed == 0 {
                return Ok(total);
            }
            total += claimed;
        }
        anyhow::bail!("deliveries still due after {MAX_DRAIN_BATCHES} batches")
    }

    /// Runs batches and advances time by each delivery's next wait until
    /// `delivery_id` is terminal or `max_rounds` passes.
    pub async fn run_until_terminal(
        &self,
        engine: &DeliveryEngine,
        delivery_id: DeliveryId,
        max_rounds: usize,
    ) -> Result<Delivery> {
        for _ in 0..max_rounds {
            self.drain(engine).await?;
            let delivery = self.delivery(delivery_id).await?;
            if delivery.is_terminal() {
                return Ok(delivery);
            }

            let now = courier_core::Clock::now_utc(&self.clock);
            let wait = (delivery.next_attempt_at - now).to_std().unwrap_or_default();
            self.advance_time(wait + Duration::from_millis(1));
        }
        anyhow::bail!("delivery {delivery_id} not terminal after {max_rounds} rounds")
    }

    /// Loads a delivery that must exist.
    pub async fn delivery(&self, id: DeliveryId) -> Result<Delivery> {
        self.broker
            .find_delivery(id)
            .await
            .context("failed to load delivery")?
            .with_context(|| format!("delivery {id} not found"))
    }

    /// Loads all attempts of a delivery ordered by attempt number.
    pub async fn attempts(&self, id: DeliveryId) -> Result<Vec<DeliveryAttempt>> {
        let mut attempts = self
            .broker
            .list_delivery_attempts(
                ListOptions::new().filter(DeliveryAttemptFilter::DeliveryId(id)).limit(100),
            )
            .await
            .context("failed to list delivery attempts")?;
        attempts.sort_by_key(|attempt| attempt.attempt_number);
        Ok(attempts)
    }
}
