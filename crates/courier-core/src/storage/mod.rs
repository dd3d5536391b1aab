//! Database access layer implementing the repository pattern for broker
//! persistence.
//!
//! Each entity has a repository over a shared `PgPool`. Operations that must
//! be atomic (fan-out, claiming, recording an attempt outcome) take an
//! explicit `Transaction` and are composed by the `BrokerStorage`
//! implementation for `Storage`. `MemoryStorage` provides the same contract
//! in process for tests and embedded use.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

pub mod deliveries;
pub mod delivery_attempts;
mod memory;
pub mod messages;
mod postgres;
pub mod schema;
pub mod subscriptions;
pub mod topics;

pub use memory::MemoryStorage;

use crate::{
    error::Result,
    filter::{
        DeliveryAttemptFilter, DeliveryFilter, ListOptions, MessageFilter, SubscriptionFilter,
        TopicFilter,
    },
    models::{
        ClaimedDelivery, Delivery, DeliveryAttempt, DeliveryAttemptId, DeliveryId,
        DeliveryTransition, Message, MessageId, Subscription, SubscriptionId, Topic, TopicId,
    },
};

/// Boxed future returned by `BrokerStorage` operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Parameters for claiming due deliveries.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Identifier of the claiming worker, recorded as `claimed_by`.
    pub worker_id: String,
    /// Current time; deliveries with `next_attempt_at <= now` are due.
    pub now: DateTime<Utc>,
    /// Maximum number of deliveries to claim.
    pub limit: usize,
    /// Added to each delivery's attempt timeout to form the lease length.
    pub lease_grace: Duration,
}

/// Outcome of one attempt, to be recorded atomically with its transition.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Delivery the attempt belongs to.
    pub delivery_id: DeliveryId,
    /// Claim token received when the delivery was claimed.
    pub claim_token: Uuid,
    /// Attempt record. Its `attempt_number` is assigned by the store from
    /// the delivery's incremented `attempt_count`.
    pub attempt: DeliveryAttempt,
    /// State change decided by the retry policy.
    pub transition: DeliveryTransition,
    /// Time the outcome is recorded.
    pub completed_at: DateTime<Utc>,
}

/// Result of publishing a message.
#[derive(Debug, Clone)]
pub struct FanOut {
    /// The stored message.
    pub message: Message,
    /// One pending delivery per subscription of the topic.
    pub deliveries: Vec<Delivery>,
}

/// Every storage operation the broker and the delivery engine rely on.
///
/// Implementations must make `publish`, `claim_due` and `complete_attempt`
/// atomic: either every row is written or none is.
pub trait BrokerStorage: Send + Sync {
    /// Inserts a topic; `AlreadyExists` if the id is taken.
    fn create_topic(&self, topic: Topic) -> StorageFuture<'_, Topic>;
    /// Replaces a topic's mutable fields; `NotFound` if absent.
    fn update_topic(&self, topic: Topic) -> StorageFuture<'_, Topic>;
    /// Deletes a topic and its subscriptions, keeping history.
    fn delete_topic(&self, id: TopicId) -> StorageFuture<'_, ()>;
    /// Finds a topic by id.
    fn find_topic(&self, id: TopicId) -> StorageFuture<'_, Option<Topic>>;
    /// Lists topics.
    fn list_topics(&self, options: ListOptions<TopicFilter>) -> StorageFuture<'_, Vec<Topic>>;

    /// Inserts a subscription; `NotFound` if its topic is absent.
    fn create_subscription(&self, subscription: Subscription)
        -> StorageFuture<'_, Subscription>;
    /// Replaces a subscription's mutable fields; `NotFound` if absent.
    fn update_subscription(&self, subscription: Subscription)
        -> StorageFuture<'_, Subscription>;
    /// Deletes a subscription, keeping its deliveries.
    fn delete_subscription(&self, id: SubscriptionId) -> StorageFuture<'_, ()>;
    /// Finds a subscription by id.
    fn find_subscription(&self, id: SubscriptionId) -> StorageFuture<'_, Option<Subscription>>;
    /// Lists subscriptions.
    fn list_subscriptions(
        &self,
        options: ListOptions<SubscriptionFilter>,
    ) -> StorageFuture<'_, Vec<Subscription>>;

    /// Stores a message and one delivery per subscription of its topic.
    ///
    /// Fails with `NotFound` if the topic does not exist, writing nothing.
    fn publish(&self, message: Message, now: DateTime<Utc>) -> StorageFuture<'_, FanOut>;
    /// Finds a message by id.
    fn find_message(&self, id: MessageId) -> StorageFuture<'_, Option<Message>>;
    /// Lists messages.
    fn list_messages(&self, options: ListOptions<MessageFilter>)
        -> StorageFuture<'_, Vec<Message>>;

    /// Finds a delivery by id.
    fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<Delivery>>;
    /// Lists deliveries.
    fn list_deliveries(
        &self,
        options: ListOptions<DeliveryFilter>,
    ) -> StorageFuture<'_, Vec<Delivery>>;

    /// Finds a delivery attempt by id.
    fn find_delivery_attempt(
        &self,
        id: DeliveryAttemptId,
    ) -> StorageFuture<'_, Option<DeliveryAttempt>>;
    /// Lists delivery attempts.
    fn list_delivery_attempts(
        &self,
        options: ListOptions<DeliveryAttemptFilter>,
    ) -> StorageFuture<'_, Vec<DeliveryAttempt>>;

    /// Claims up to `request.limit` due deliveries with a lease.
    ///
    /// No delivery is handed to two claimants while a lease is live.
    fn claim_due(&self, request: ClaimRequest) -> StorageFuture<'_, Vec<ClaimedDelivery>>;

    /// Records an attempt and applies its transition if the claim is held.
    ///
    /// Fails with `ClaimLost` and writes nothing when the claim token no
    /// longer matches.
    fn complete_attempt(&self, completion: Completion) -> StorageFuture<'_, Delivery>;
}

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<PgPool>,

    /// Repository for topic operations.
    pub topics: Arc<topics::Repository>,

    /// Repository for subscription operations.
    pub subscriptions: Arc<subscriptions::Repository>,

    /// Repository for message operations.
    pub messages: Arc<messages::Repository>,

    /// Repository for delivery operations.
    pub deliveries: Arc<deliveries::Repository>,

    /// Repository for delivery attempt tracking.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            topics: Arc::new(topics::Repository::new(pool.clone())),
            subscriptions: Arc::new(subscriptions::Repository::new(pool.clone())),
            messages: Arc::new(messages::Repository::new(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Starts a transaction. It rolls back when dropped without `commit`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if no connection could be acquired.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}
