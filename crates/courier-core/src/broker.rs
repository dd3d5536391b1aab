//! Library API of the broker.
//!
//! `Broker` validates caller input, stamps identifiers and timestamps from
//! the injected clock, and delegates persistence to a `BrokerStorage`.
//! Validation failures are returned before anything is written.

use std::{sync::Arc, time::Duration};

use tracing::{info, instrument};
use url::Url;

use crate::{
    error::{CoreError, Result},
    filter::{
        DeliveryAttemptFilter, DeliveryFilter, ListOptions, MessageFilter, SubscriptionFilter,
        TopicFilter,
    },
    models::{
        duration_to_millis, Delivery, DeliveryAttempt, DeliveryAttemptId, DeliveryId, Message,
        MessageId, Subscription, SubscriptionId, Topic, TopicId, MAX_POLICY_DURATION,
    },
    storage::{BrokerStorage, FanOut},
    time::Clock,
};

/// Content type used when a publisher does not provide one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Input for creating or updating a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParams {
    /// Caller-supplied id; generated when absent. Ignored on update.
    pub id: Option<TopicId>,
    /// Human-readable name, must not be blank.
    pub name: String,
}

impl TopicParams {
    /// Creates params with a generated id.
    pub fn new(name: impl Into<String>) -> Self {
        Self { id: None, name: name.into() }
    }
}

/// Input for creating or updating a subscription.
#[derive(Clone, PartialEq, Eq)]
pub struct SubscriptionParams {
    /// Caller-supplied id; generated when absent. Ignored on update.
    pub id: Option<SubscriptionId>,
    /// Topic to listen to; must exist.
    pub topic_id: TopicId,
    /// Human-readable name, must not be blank.
    pub name: String,
    /// Absolute `http` or `https` endpoint.
    pub url: String,
    /// Key for request signatures, must not be empty.
    pub secret_token: String,
    /// At least one.
    pub max_delivery_attempts: i32,
    /// Base retry interval, at least one millisecond.
    pub delivery_attempt_delay: Duration,
    /// Per-attempt timeout, at least one millisecond.
    pub delivery_attempt_timeout: Duration,
}

impl std::fmt::Debug for SubscriptionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionParams")
            .field("id", &self.id)
            .field("topic_id", &self.topic_id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("secret_token", &"[redacted]")
            .field("max_delivery_attempts", &self.max_delivery_attempts)
            .field("delivery_attempt_delay", &self.delivery_attempt_delay)
            .field("delivery_attempt_timeout", &self.delivery_attempt_timeout)
            .finish()
    }
}

/// Entry point for topic, subscription and message operations.
#[derive(Clone)]
pub struct Broker {
    storage: Arc<dyn BrokerStorage>,
    clock: Arc<dyn Clock>,
}

impl Broker {
    /// Creates a broker over the given storage and clock.
    pub fn new(storage: Arc<dyn BrokerStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Creates a topic.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a blank name, `AlreadyExists` for a taken id.
    #[instrument(name = "create_topic", skip(self), fields(name = %params.name))]
    pub async fn create_topic(&self, params: TopicParams) -> Result<Topic> {
        validate_name("topic", &params.name)?;

        let now = self.clock.now_utc();
        let topic = Topic {
            id: params.id.unwrap_or_default(),
            name: params.name,
            created_at: now,
            updated_at: now,
        };
        let topic = self.storage.create_topic(topic).await?;

        info!(topic_id = %topic.id, "topic created");
        Ok(topic)
    }

    /// Renames an existing topic.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a blank name, `NotFound` if the topic is absent.
    #[instrument(name = "update_topic", skip(self, params), fields(topic_id = %id))]
    pub async fn update_topic(&self, id: TopicId, params: TopicParams) -> Result<Topic> {
        validate_name("topic", &params.name)?;

        let now = self.clock.now_utc();
        let topic = Topic { id, name: params.name, created_at: now, updated_at: now };
        let topic = self.storage.update_topic(topic).await?;

        info!("topic updated");
        Ok(topic)
    }

    /// Deletes a topic and its subscriptions.
    ///
    /// Messages, deliveries and attempts are kept; pending deliveries of the
    /// topic continue with their captured policy.
    ///
    /// # Errors
    ///
    /// `NotFound` if the topic is absent.
    #[instrument(name = "delete_topic", skip(self), fields(topic_id = %id))]
    pub async fn delete_topic(&self, id: TopicId) -> Result<()> {
        self.storage.delete_topic(id).await?;
        info!("topic deleted");
        Ok(())
    }

    /// Finds a topic by id.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn find_topic(&self, id: TopicId) -> Result<Option<Topic>> {
        self.storage.find_topic(id).await
    }

    /// Lists topics.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn list_topics(&self, options: ListOptions<TopicFilter>) -> Result<Vec<Topic>> {
        self.storage.list_topics(options).await
    }

    /// Creates a subscription on an existing topic.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an invalid policy or endpoint, `NotFound` if the
    /// topic is absent, `AlreadyExists` for a taken id.
    #[instrument(
        name = "create_subscription",
        skip(self, params),
        fields(topic_id = %params.topic_id, name = %params.name)
    )]
    pub async fn create_subscription(&self, params: SubscriptionParams) -> Result<Subscription> {
        validate_subscription(&params)?;

        let now = self.clock.now_utc();
        let id = params.id.unwrap_or_default();
        let subscription = build_subscription(id, params, now);
        let subscription = self.storage.create_subscription(subscription).await?;

        info!(subscription_id = %subscription.id, "subscription created");
        Ok(subscription)
    }

    /// Replaces every mutable field of a subscription.
    ///
    /// Only deliveries fanned out afterwards use the new values.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an invalid policy or endpoint, `NotFound` if the
    /// subscription or its new topic is absent.
    #[instrument(name = "update_subscription", skip(self, params), fields(subscription_id = %id))]
    pub async fn update_subscription(
        &self,
        id: SubscriptionId,
        params: SubscriptionParams,
    ) -> Result<Subscription> {
        validate_subscription(&params)?;

        let now = self.clock.now_utc();
        let subscription = build_subscription(id, params, now);
        let subscription = self.storage.update_subscription(subscription).await?;

        info!("subscription updated");
        Ok(subscription)
    }

    /// Deletes a subscription. Its deliveries are kept and still attempted.
    ///
    /// # Errors
    ///
    /// `NotFound` if the subscription is absent.
    #[instrument(name = "delete_subscription", skip(self), fields(subscription_id = %id))]
    pub async fn delete_subscription(&self, id: SubscriptionId) -> Result<()> {
        self.storage.delete_subscription(id).await?;
        info!("subscription deleted");
        Ok(())
    }

    /// Finds a subscription by id.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn find_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.storage.find_subscription(id).await
    }

    /// Lists subscriptions.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn list_subscriptions(
        &self,
        options: ListOptions<SubscriptionFilter>,
    ) -> Result<Vec<Subscription>> {
        self.storage.list_subscriptions(options).await
    }

    /// Publishes a message and fans it out to every subscription of the
    /// topic in one atomic step.
    ///
    /// A topic with no subscriptions stores the message with no deliveries.
    /// `content_type` defaults to `application/json`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the topic is absent, `InvalidInput` for a blank content
    /// type. Nothing is written on error.
    #[instrument(
        name = "publish",
        skip(self, payload),
        fields(topic_id = %topic_id, payload_size = payload.len())
    )]
    pub async fn publish(
        &self,
        topic_id: TopicId,
        content_type: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<FanOut> {
        let content_type = content_type.unwrap_or(DEFAULT_CONTENT_TYPE);
        if content_type.trim().is_empty() {
            return Err(CoreError::invalid("content type must not be blank"));
        }

        let now = self.clock.now_utc();
        let message = Message {
            id: MessageId::new(),
            topic_id,
            content_type: content_type.to_string(),
            payload,
            created_at: now,
            updated_at: now,
        };
        let fan_out = self.storage.publish(message, now).await?;

        info!(
            message_id = %fan_out.message.id,
            deliveries = fan_out.deliveries.len(),
            "message published"
        );
        Ok(fan_out)
    }

    /// Finds a message by id.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn find_message(&self, id: MessageId) -> Result<Option<Message>> {
        self.storage.find_message(id).await
    }

    /// Lists messages.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn list_messages(&self, options: ListOptions<MessageFilter>) -> Result<Vec<Message>> {
        self.storage.list_messages(options).await
    }

    /// Finds a delivery by id.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn find_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        self.storage.find_delivery(id).await
    }

    /// Lists deliveries.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn list_deliveries(
        &self,
        options: ListOptions<DeliveryFilter>,
    ) -> Result<Vec<Delivery>> {
        self.storage.list_deliveries(options).await
    }

    /// Finds a delivery attempt by id.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn find_delivery_attempt(
        &self,
        id: DeliveryAttemptId,
    ) -> Result<Option<DeliveryAttempt>> {
        self.storage.find_delivery_attempt(id).await
    }

    /// Lists delivery attempts.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn list_delivery_attempts(
        &self,
        options: ListOptions<DeliveryAttemptFilter>,
    ) -> Result<Vec<DeliveryAttempt>> {
        self.storage.list_delivery_attempts(options).await
    }
}

fn build_subscription(
    id: SubscriptionId,
    params: SubscriptionParams,
    now: chrono::DateTime<chrono::Utc>,
) -> Subscription {
    Subscription {
        id,
        topic_id: params.topic_id,
        name: params.name,
        url: params.url,
        secret_token: params.secret_token,
        max_delivery_attempts: params.max_delivery_attempts,
        delivery_attempt_delay_ms: duration_to_millis(params.delivery_attempt_delay),
        delivery_attempt_timeout_ms: duration_to_millis(params.delivery_attempt_timeout),
        created_at: now,
        updated_at: now,
    }
}

fn validate_name(entity: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CoreError::invalid(format!("{entity} name must not be blank")));
    }
    Ok(())
}

fn validate_subscription(params: &SubscriptionParams) -> Result<()> {
    validate_name("subscription", &params.name)?;
    validate_url(&params.url)?;

    if params.secret_token.is_empty() {
        return Err(CoreError::invalid("secret token must not be empty"));
    }
    if params.max_delivery_attempts < 1 {
        return Err(CoreError::invalid(format!(
            "max_delivery_attempts must be at least 1, got {}",
            params.max_delivery_attempts
        )));
    }
    validate_policy_duration("delivery_attempt_delay", params.delivery_attempt_delay)?;
    validate_policy_duration("delivery_attempt_timeout", params.delivery_attempt_timeout)
}

fn validate_policy_duration(field: &str, value: Duration) -> Result<()> {
    if value < Duration::from_millis(1) {
        return Err(CoreError::invalid(format!("{field} must be at least 1ms")));
    }
    if value > MAX_POLICY_DURATION {
        return Err(CoreError::invalid(format!(
            "{field} must be at most {}s, got {}s",
            MAX_POLICY_DURATION.as_secs(),
            value.as_secs()
        )));
    }
    Ok(())
}

fn validate_url(raw: &str) -> Result<()> {
    let url =
        Url::parse(raw).map_err(|e| CoreError::invalid(format!("invalid url {raw:?}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(CoreError::invalid(format!(
            "url scheme must be http or https, got {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(CoreError::invalid(format!("url {raw:?} has no host")));
    }
    Ok(())
}
