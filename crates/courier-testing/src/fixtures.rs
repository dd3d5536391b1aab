//! Fixture builders for broker entities.

use std::time::Duration;

use chrono::Utc;
use courier_core::{
    Delivery, Message, MessageId, Subscription, SubscriptionId, SubscriptionParams, TopicId,
};
use rand::{distr::Alphanumeric, rngs::StdRng, Rng, SeedableRng};

/// Secret used by fixtures unless overridden.
pub const TEST_SECRET: &str = "whsec_test_secret";

/// Builder for subscription parameters with test-friendly defaults.
///
/// Defaults: three attempts, 1s base delay, 5s timeout.
#[derive(Debug, Clone)]
pub struct SubscriptionBuilder {
    params: SubscriptionParams,
}

impl SubscriptionBuilder {
    /// Starts a subscription of `topic_id` delivering to `url`.
    pub fn new(topic_id: TopicId, url: impl Into<String>) -> Self {
        Self {
            params: SubscriptionParams {
                id: None,
                topic_id,
                name: "test-subscription".to_string(),
                url: url.into(),
                secret_token: TEST_SECRET.to_string(),
                max_delivery_attempts: 3,
                delivery_attempt_delay: Duration::from_secs(1),
                delivery_attempt_timeout: Duration::from_secs(5),
            },
        }
    }

    /// Uses a fixed id.
    #[must_use]
    pub fn id(mut self, id: SubscriptionId) -> Self {
        self.params.id = Some(id);
        self
    }

    /// Sets the name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.params.name = name.into();
        self
    }

    /// Sets the signing secret.
    #[must_use]
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.params.secret_token = secret.into();
        self
    }

    /// Sets the attempt budget.
    #[must_use]
    pub fn max_attempts(mut self, attempts: i32) -> Self {
        self.params.max_delivery_attempts = attempts;
        self
    }

    /// Sets the base retry delay.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.params.delivery_attempt_delay = delay;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.params.delivery_attempt_timeout = timeout;
        self
    }

    /// Returns the parameters.
    pub fn build(self) -> SubscriptionParams {
        self.params
    }
}

/// Builds a stored-looking subscription without going through a broker.
pub fn subscription(topic_id: TopicId, url: &str) -> Subscription {
    let now = Utc::now();
    Subscription {
        id: SubscriptionId::new(),
        topic_id,
        name: "fixture".to_string(),
        url: url.to_string(),
        secret_token: TEST_SECRET.to_string(),
        max_delivery_attempts: 3,
        delivery_attempt_delay_ms: 1_000,
        delivery_attempt_timeout_ms: 5_000,
        created_at: now,
        updated_at: now,
    }
}

/// Builds a message for `topic_id` carrying `payload`.
pub fn message(topic_id: TopicId, payload: &[u8]) -> Message {
    let now = Utc::now();
    Message {
        id: MessageId::new(),
        topic_id,
        content_type: "application/json".to_string(),
        payload: payload.to_vec(),
        created_at: now,
        updated_at: now,
    }
}

/// Builds a pending delivery of `message` for `subscription`.
pub fn delivery(message: &Message, subscription: &Subscription) -> Delivery {
    Delivery::for_subscription(message, subscription, message.created_at)
}

/// Deterministic generator for payloads and names.
#[derive(Debug)]
pub struct FixtureRng {
    rng: StdRng,
}

impl FixtureRng {
    /// Creates a generator from a seed, so failures can be replayed.
    pub fn seeded(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    /// Random bytes of the given length.
    pub fn payload(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.rng.random()).collect()
    }

    /// Random JSON object payload with `fields` string fields.
    pub fn json_payload(&mut self, fields: usize) -> Vec<u8> {
        let body = (0..fields)
            .map(|i| format!("\"field_{i}\":\"{}\"", self.name(12)))
            .collect::<Vec<_>>()
            .join(",");
        format!("{{{body}}}").into_bytes()
    }

    /// Random alphanumeric string.
    pub fn name(&mut self, len: usize) -> String {
        (&mut self.rng).sample_iter(&Alphanumeric).take(len).map(char::from).collect()
    }

    /// Random value in `range`.
    pub fn between(&mut self, range: std::ops::Range<usize>) -> usize {
        self.rng.random_range(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_rng_is_reproducible() {
        let mut a = FixtureRng::seeded(7);
        let mut b = FixtureRng::seeded(7);

        assert_eq!(a.payload(32), b.payload(32));
        assert_eq!(a.name(8), b.name(8));
    }

    #[test]
    fn json_payload_parses() {
        let mut rng = FixtureRng::seeded(1);
        let payload = rng.json_payload(3);

        let text = String::from_utf8(payload).unwrap();
        assert!(text.starts_with("{\"field_0\":"));
        assert_eq!(text.matches("field_").count(), 3);
    }

    #[test]
    fn builder_overrides_defaults() {
        let topic = TopicId::new();
        let params = SubscriptionBuilder::new(topic, "https://example.com/hook")
            .max_attempts(5)
            .delay(Duration::from_millis(250))
            .secret("other")
            .build();

        assert_eq!(params.topic_id, topic);
        assert_eq!(params.max_delivery_attempts, 5);
        assert_eq!(params.delivery_attempt_delay, Duration::from_millis(250));
        assert_eq!(params.secret_token, "other");
    }

    #[test]
    fn delivery_fixture_copies_policy() {
        let topic = TopicId::new();
        let subscription = subscription(topic, "https://example.com/hook");
        let message = message(topic, b"{}");

        let delivery = delivery(&message, &subscription);
        assert_eq!(delivery.max_delivery_attempts, subscription.max_delivery_attempts);
        assert_eq!(delivery.next_attempt_at, message.created_at);
    }
}
